use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type StudioResult<T> = Result<T, StudioError>;

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    UserInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model response was malformed: {0}")]
    MalformedResponse(String),
}

impl StudioError {
    pub fn kind(&self) -> &'static str {
        match self {
            StudioError::Configuration(_) => "configuration",
            StudioError::UserInput(_) => "user_input",
            StudioError::NotFound(_) => "not_found",
            StudioError::Transport(_) => "transport",
            StudioError::MalformedResponse(_) => "malformed_response",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            StudioError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StudioError::UserInput(_) => StatusCode::BAD_REQUEST,
            StudioError::NotFound(_) => StatusCode::NOT_FOUND,
            StudioError::Transport(_) | StudioError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for StudioError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_malformed_map_to_bad_gateway() {
        assert_eq!(
            StudioError::Transport("boom".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StudioError::MalformedResponse("not json".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn user_input_is_a_client_error() {
        let err = StudioError::UserInput("upload an image first".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "user_input");
    }
}
