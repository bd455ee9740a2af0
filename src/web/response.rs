use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::Error;

/// CORS headers carried by every public stream response.
pub const CORS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization"),
];

/// `{code, message}` JSON error with the matching HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    extra: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::SignatureInvalid | Error::LinkExpired => StatusCode::UNAUTHORIZED,
            Error::ChannelUnavailable(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::WorkerNotReady { .. } => StatusCode::ACCEPTED,
            Error::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }

        let extra = match &err {
            Error::WorkerNotReady {
                channel_id,
                retry_after,
            } => Some(json!({
                "retry_after": retry_after.as_secs_f64(),
                "channel_id": channel_id,
            })),
            _ => None,
        };

        Self {
            status,
            message: err.to_string(),
            extra,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.status.as_u16(),
            "message": self.message,
        });
        if let (Some(Value::Object(extra)), Some(map)) = (self.extra, body.as_object_mut()) {
            map.extend(extra);
        }
        (self.status, CORS, Json(body)).into_response()
    }
}

pub type ApiResult<T = Json<Value>> = Result<T, ApiError>;

/// `{code: 200, message: "success", data}`
pub fn success<T: Serialize>(data: T) -> ApiResult {
    let data = serde_json::to_value(data).map_err(Error::from)?;
    Ok(Json(json!({
        "code": 200,
        "message": "success",
        "data": data,
    })))
}

pub fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid channel id: {raw}")))
}
