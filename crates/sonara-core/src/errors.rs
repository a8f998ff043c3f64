use thiserror::Error;

#[derive(Debug, Error)]
pub enum SonaraError {
    /// `connect` was called on a context that was never configured.
    /// This is a programming error, not a recoverable condition.
    #[error("engine not configured: call init() before connect()")]
    ConfigurationMissing,
    /// `init` was called a second time on the same context.
    #[error("engine configuration already set")]
    AlreadyConfigured,
    #[error("configuration file: {0}")]
    Config(String),
    #[error("join failed: {0}")]
    Join(String),
    #[error("device acquisition failed: {0}")]
    Device(String),
    #[error("engine error: {0}")]
    Engine(String),
}
