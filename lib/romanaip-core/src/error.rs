use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("malformed romanaIP annotation: {0}")]
    MalformedAnnotation(#[source] serde_json::Error),

    #[error("romanaIP address is not a valid IP: {0}")]
    InvalidAddress(String),

    #[error("no backing pod found for service: {0}")]
    EndpointNotFound(String),

    #[error("no address reported for node: {0}")]
    NodeAddressNotFound(String),

    #[error("agent push failed: {0}")]
    PushFailure(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::PushFailure(err.to_string())
    }
}
