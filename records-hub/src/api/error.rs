use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use records_hub_core::Error;
use serde::Serialize;

/// Error body returned by every endpoint.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    /// The blob store failed; treated as unavailable storage.
    Blob(anyhow::Error),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::NotAuthorized(_) | Error::NotOwner(_) => StatusCode::FORBIDDEN,
        Error::InvalidParent(_) | Error::InvalidName(_) | Error::SelfShare => {
            StatusCode::BAD_REQUEST
        }
        Error::CycleDetected { .. } | Error::NameConflict(_) | Error::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::Core(err) => (
                status_for(err),
                ErrorBody {
                    error: err.kind(),
                    message: err.to_string(),
                },
            ),
            ApiError::Blob(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: "storage_unavailable",
                    message: format!("{err:#}"),
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "bad_request",
                    message: message.clone(),
                },
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = body.error, message = %body.message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for(&Error::NotFound(Uuid::nil())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::NotOwner(Uuid::nil())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::SelfShare), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::NameConflict("Labs".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::StorageUnavailable("disk".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
