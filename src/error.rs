use thiserror::Error;

use crate::core::ExertionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected at exertion: {name}")]
    Cycle { name: String },

    #[error("Duplicate exertion id in tree: {0}")]
    DuplicateId(ExertionId),

    #[error("Exertion {0} is already being dispatched")]
    AlreadyDispatching(ExertionId),

    #[error("Work queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Provisioning of {service} failed: {reason}")]
    Provisioning { service: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service call failed: {0}")]
    ServiceCall(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Graph construction failures. Fatal at dispatch construction, never retried.
    pub fn is_sorting(&self) -> bool {
        matches!(self, Error::Cycle { .. } | Error::DuplicateId(_))
    }

    /// Infrastructure failures raised while constructing or running a dispatcher.
    pub fn is_dispatcher(&self) -> bool {
        matches!(
            self,
            Error::AlreadyDispatching(_)
                | Error::QueueUnavailable(_)
                | Error::Provisioning { .. }
                | Error::TaskJoin(_)
                | Error::Panicked(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
