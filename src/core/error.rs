use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("invalid template {id}: {reason}")]
    InvalidTemplate { id: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProjectionError {
    pub(crate) fn invalid_template(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
