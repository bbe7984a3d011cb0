mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use tracing::debug;

pub use settings::{
    ConsumerSettings, IngressSettings, LifecycleSettings, LogBrokerSettings, LoggingSettings,
    ProducerSettings, QueueBrokerSettings, ReaderSettings, RetrySettings, RouteSettings, Settings,
};

/// Prefix of environment overrides, e.g. `RELAYMQ__PRODUCER__MAX_BATCH_MESSAGES=500`.
pub const ENV_PREFIX: &str = "RELAYMQ";

/// Loads the configuration from `config/default` and environment variables.
///
/// A `.env` file in the working directory is loaded first if present.
/// Values not given by any source keep their defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit base file (extension optional).
pub fn load_config_from(base: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", path.display());
    }

    let base = base.as_ref().to_string_lossy().into_owned();
    let builder = Config::builder()
        .add_source(File::with_name(&base).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    builder.build()?.try_deserialize()
}
