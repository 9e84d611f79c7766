//! HTTP envelope types: every response is JSON-shaped as
//! `{success, data?, message?, error?, details?}`.

use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::error::GatewayError;

/// Success envelope.
pub struct ApiSuccess {
    status: StatusCode,
    data: Option<Value>,
    message: Option<String>,
}

impl ApiSuccess {
    pub fn ok(data: Value) -> Self {
        Self {
            status: StatusCode::OK,
            data: Some(data),
            message: None,
        }
    }

    pub fn created(data: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            data: Some(data),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            data: None,
            message: Some(message.into()),
        }
    }
}

impl IntoResponse for ApiSuccess {
    fn into_response(self) -> Response {
        let mut body = json!({"success": true});

        if let Some(data) = self.data {
            body["data"] = data;
        }

        if let Some(message) = self.message {
            body["message"] = Value::String(message);
        }

        (self.status, Json(body)).into_response()
    }
}

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[inline]
    #[track_caller]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            msg: None,
        }
    }

    #[inline]
    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            error_code: None,
            loc: self.loc,
            msg: self.msg.map(str::to_owned),
            source: Some(source.into()),
        }
    }

    #[inline]
    pub fn msg(self, msg: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            error_code: None,
            loc: self.loc,
            msg: Some(msg.to_owned()),
            source: None,
        }
    }
}

/// Error envelope carrying the machine code mirrored from
/// [`GatewayError::code`] when one applies.
pub struct HttpError {
    pub code: StatusCode,
    pub error_code: Option<&'static str>,
    pub loc: &'static Location<'static>,
    pub msg: Option<String>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[inline]
    #[track_caller]
    pub fn unauthorized() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::UNAUTHORIZED)
    }

    #[inline]
    #[track_caller]
    pub fn forbidden() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::FORBIDDEN)
    }

    #[inline]
    #[track_caller]
    pub fn not_found() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND)
    }

    #[inline]
    #[track_caller]
    pub fn bad_request() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_REQUEST)
    }

    #[inline]
    #[track_caller]
    pub fn internal() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<GatewayError> for HttpError {
    #[track_caller]
    fn from(error: GatewayError) -> Self {
        HttpError {
            code: error.status(),
            error_code: Some(error.code()),
            loc: Location::caller(),
            msg: Some(error.to_string()),
            source: None,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(msg) = &self.msg {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.code.is_server_error() {
            error!(error = %self);
        } else {
            debug!(error = %self);
        }

        let mut body = json!({
            "success": false,
            "error": self.error_code.unwrap_or_else(|| self.code.canonical_reason().unwrap_or("Error")),
        });

        if let Some(msg) = self.msg {
            body["message"] = Value::String(msg);
        }

        if let Some(source) = self.source.as_deref() {
            body["details"] = Value::String(source.to_string());
        }

        (self.code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;

    #[test]
    fn gateway_errors_map_to_their_status_and_code() {
        let error = HttpError::from(GatewayError::NotFound(UserId::from("alice")));

        assert_eq!(error.code, StatusCode::NOT_FOUND);
        assert_eq!(error.error_code, Some("NotFound"));
    }

    #[test]
    fn builder_keeps_the_caller_location() {
        let error = HttpError::bad_request().msg("nope");
        assert!(error.loc.file().ends_with("http.rs"));
        assert_eq!(error.code, StatusCode::BAD_REQUEST);
    }
}
