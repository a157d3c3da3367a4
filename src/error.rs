use crate::response::Status;
use serde::{Deserialize, Serialize};
use serde_json;
use std::error;
use std::fmt;
use thiserror::Error;

/// Failures raised by the matching engine itself.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("missing required fields: {}", .missing.join(", "))]
    Validation { missing: Vec<String> },
    #[error("scoring model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("index build failed: {0}")]
    IndexBuild(String),
    #[error("record '{record_id}' lacks field '{field}' expected by the model")]
    Scoring { record_id: String, field: String },
    #[error("clustering failed: {0}")]
    Clustering(String),
    #[error("run cancelled before clustering")]
    Cancelled,
    #[error("worker pool could not start: {0}")]
    WorkerPool(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "ValidationError",
            EngineError::ModelUnavailable(_) => "ModelUnavailableError",
            EngineError::IndexBuild(_) => "IndexBuildError",
            EngineError::Scoring { .. } => "ScoringError",
            EngineError::Clustering(_) => "ClusteringError",
            EngineError::Cancelled => "CancelledError",
            EngineError::WorkerPool(_) => "WorkerPoolError",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceError {
    pub kind: String,
    pub msg: String,
    pub status: Status,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json)
    }
}

impl error::Error for ServiceError {}

impl ServiceError {
    pub fn bad_request<T: std::fmt::Display>(msg: T) -> ServiceError {
        ServiceError {
            kind: String::from("ValidationError"),
            msg: msg.to_string(),
            status: Status::BadRequest,
        }
    }

    pub fn internal_server_error<T: std::fmt::Display>(msg: T) -> ServiceError {
        ServiceError {
            kind: String::from("InternalError"),
            msg: msg.to_string(),
            status: Status::InternalServerError,
        }
    }

    pub fn service_unavailable<T: std::fmt::Display>(msg: T) -> ServiceError {
        ServiceError {
            kind: String::from("ModelUnavailableError"),
            msg: msg.to_string(),
            status: Status::ServiceUnavailable,
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation { .. } => ServiceError::bad_request(&err),
            EngineError::ModelUnavailable(_) => {
                log::error!("{}", err);
                ServiceError::service_unavailable("Scoring model is not available")
            }
            EngineError::Cancelled => ServiceError {
                kind: String::from(err.kind()),
                msg: String::from("Deduplication run did not finish in time"),
                status: Status::GatewayTimeout,
            },
            _ => {
                log::error!("{}: {}", err.kind(), err);
                ServiceError {
                    kind: String::from("InternalError"),
                    msg: String::from("Matching engine failed; see service logs"),
                    status: Status::InternalServerError,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_names_missing_fields() {
        let err = EngineError::Validation {
            missing: vec!["EMAIL".into(), "NODE".into()],
        };
        let service: ServiceError = err.into();
        assert!(matches!(service.status, Status::BadRequest));
        assert_eq!(service.msg, "missing required fields: EMAIL, NODE");
    }

    #[test]
    fn internal_failures_do_not_leak_detail() {
        let err = EngineError::Scoring {
            record_id: "42".into(),
            field: "EMAIL".into(),
        };
        let service: ServiceError = err.into();
        assert!(matches!(service.status, Status::InternalServerError));
        assert!(!service.msg.contains("42"));
    }

    #[test]
    fn model_and_cancellation_map_to_distinct_statuses() {
        let unavailable: ServiceError = EngineError::ModelUnavailable("corrupt".into()).into();
        assert!(matches!(unavailable.status, Status::ServiceUnavailable));
        let cancelled: ServiceError = EngineError::Cancelled.into();
        assert!(matches!(cancelled.status, Status::GatewayTimeout));
    }

    #[test]
    fn worker_pool_failure_is_an_internal_error() {
        let service: ServiceError = EngineError::WorkerPool("no threads".into()).into();
        assert!(matches!(service.status, Status::InternalServerError));
        assert_eq!(service.kind, "InternalError");
    }
}
