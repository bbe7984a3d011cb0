//! The `utils` module provides definitions shared across `relaymq`:
//! the error taxonomy and tracing initialization.

pub mod error;
pub mod logging;
