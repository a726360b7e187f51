use axum::http::StatusCode;
use tonic::Status;

/// Stable error kinds surfaced by the control plane. The variant name is
/// the contract; transports map it to their own status vocabulary.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue full for cluster {0}")]
    QueueFull(String),

    #[error("replaced by a newer session for this cluster")]
    Replaced,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("stream i/o: {0}")]
    StreamIo(String),

    #[error("internal: {source}")]
    Internal {
        #[from]
        source: anyhow::Error,
    },
}

impl ControlError {
    pub fn internal(e: impl Into<anyhow::Error>) -> Self {
        ControlError::Internal { source: e.into() }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ControlError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            ControlError::Replaced
            | ControlError::IdleTimeout
            | ControlError::StreamIo(_)
            | ControlError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ControlError> for Status {
    fn from(e: ControlError) -> Status {
        match e {
            ControlError::Unauthenticated => Status::unauthenticated("unauthenticated"),
            ControlError::NotFound(what) => Status::not_found(what),
            ControlError::Conflict(what) => Status::already_exists(what),
            ControlError::QueueFull(cluster) => {
                Status::resource_exhausted(format!("queue full for cluster {cluster}"))
            }
            ControlError::Replaced => {
                Status::already_exists("replaced by a newer session for this cluster")
            }
            ControlError::IdleTimeout => Status::deadline_exceeded("idle timeout"),
            ControlError::StreamIo(what) => Status::unavailable(what),
            ControlError::Internal { source } => {
                tracing::error!(?source, "internal error");
                Status::internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mappings() {
        assert_eq!(
            ControlError::Unauthenticated.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ControlError::QueueFull("cl_1".into()).http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ControlError::NotFound("agent".into()).http_status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn grpc_close_codes() {
        let replaced: Status = ControlError::Replaced.into();
        assert_eq!(replaced.code(), tonic::Code::AlreadyExists);
        let idle: Status = ControlError::IdleTimeout.into();
        assert_eq!(idle.code(), tonic::Code::DeadlineExceeded);
        let auth: Status = ControlError::Unauthenticated.into();
        assert_eq!(auth.code(), tonic::Code::Unauthenticated);
    }
}
