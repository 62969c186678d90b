use application::{ApplicationError, AuthError, BroadcastError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let code = error.code();
        let message = error.client_message();
        let status = match &error {
            ApplicationError::Auth(AuthError::InvalidToken | AuthError::Expired) => {
                StatusCode::UNAUTHORIZED
            }
            ApplicationError::Auth(AuthError::Banned) => StatusCode::FORBIDDEN,
            ApplicationError::Auth(
                AuthError::RateLimited | AuthError::TooManyConnections { .. },
            )
            | ApplicationError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApplicationError::AccessDenied(_) | ApplicationError::PermissionDenied(_) => {
                StatusCode::FORBIDDEN
            }
            ApplicationError::Validation(_) => StatusCode::BAD_REQUEST,
            ApplicationError::NotFound(_) => StatusCode::NOT_FOUND,
            ApplicationError::Conflict(_) => StatusCode::CONFLICT,
            ApplicationError::Broadcast(BroadcastError::Unroutable(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApplicationError::Broadcast(_) | ApplicationError::Infrastructure(_) => {
                tracing::error!(error = %error, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DomainError;

    #[test]
    fn test_auth_failures_map_to_distinct_statuses() {
        let cases = [
            (AuthError::InvalidToken, StatusCode::UNAUTHORIZED),
            (AuthError::Expired, StatusCode::UNAUTHORIZED),
            (AuthError::Banned, StatusCode::FORBIDDEN),
            (AuthError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                AuthError::TooManyConnections { current: 3, max: 3 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(ApplicationError::from(err)).status(), status);
        }
    }

    #[test]
    fn test_unroutable_is_unprocessable() {
        let err = ApiError::from(ApplicationError::from(BroadcastError::Unroutable(
            "badge.earned".into(),
        )));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.body.code, "UNROUTABLE");
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = ApiError::from(ApplicationError::infrastructure("redis://user:pw@host"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.body.message.contains("pw"));

        let err = ApiError::from(ApplicationError::from(DomainError::validation("room", "bad")));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
