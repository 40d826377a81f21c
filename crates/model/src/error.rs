use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Attention(#[from] attention::AttentionError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub(crate) fn precondition<S: Into<String>>(msg: S) -> ModelError {
    ModelError::Precondition(msg.into())
}
