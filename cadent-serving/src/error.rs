use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServingError>;

#[derive(Debug, Error)]
pub enum ServingError {
    #[error("invalid batch plan: {0}")]
    InvalidPlan(&'static str),
    #[error("invalid model config: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Transport(#[from] cadent_transport::TransportError),
}
