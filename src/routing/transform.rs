use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::utils::error::RouteError;

/// How a route decodes and re-encodes payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// JSON documents; anything else is malformed.
    #[default]
    Json,
    /// Opaque bytes.
    Raw,
}

/// A payload between deserialize and serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Raw(Vec<u8>),
}

impl MessageFormat {
    pub fn decode(&self, payload: &[u8]) -> Result<Body, RouteError> {
        match self {
            Self::Json => serde_json::from_slice(payload)
                .map(Body::Json)
                .map_err(|e| RouteError::MalformedMessage(e.to_string())),
            Self::Raw => Ok(Body::Raw(payload.to_vec())),
        }
    }

    pub fn encode(&self, body: &Body) -> Result<Vec<u8>, RouteError> {
        match body {
            Body::Json(value) => serde_json::to_vec(value)
                .map_err(|e| RouteError::TransformFailure(e.to_string())),
            Body::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// The processing step of a route.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, body: Body) -> Result<Body, RouteError>;
}

/// Leaves the body untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&self, body: Body) -> Result<Body, RouteError> {
        Ok(body)
    }
}

/// Logs every body it sees and passes it on.
#[derive(Debug, Clone)]
pub struct LogTransform {
    route: String,
}

impl LogTransform {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
        }
    }
}

impl Transform for LogTransform {
    fn apply(&self, body: Body) -> Result<Body, RouteError> {
        match &body {
            Body::Json(value) => info!("[{}] Processing message: {}", self.route, value),
            Body::Raw(bytes) => info!(
                "[{}] Processing message: {}",
                self.route,
                String::from_utf8_lossy(bytes)
            ),
        }
        Ok(body)
    }
}

struct FnTransform<F>(F);

impl<F> Transform for FnTransform<F>
where
    F: Fn(Body) -> Result<Body, RouteError> + Send + Sync + 'static,
{
    fn apply(&self, body: Body) -> Result<Body, RouteError> {
        (self.0)(body)
    }
}

/// Wraps a closure as a [`Transform`].
pub fn transform_fn<F>(f: F) -> impl Transform
where
    F: Fn(Body) -> Result<Body, RouteError> + Send + Sync + 'static,
{
    FnTransform(f)
}
