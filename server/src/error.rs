use hyper::{header, Body, Response, StatusCode};
use std::convert::TryFrom;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unauthorized access")]
    Unauthorized,

    #[error("Access denied your ip is not in whitelist")]
    Forbidden,

    #[error("object not found")]
    NotFound,

    #[error("{0}")]
    Invalid(String),

    #[error("internal database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid key format")]
    InvalidKey,

    #[error("internal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing/serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Generic Hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ServerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

impl From<wireguard_control::InvalidKey> for ServerError {
    fn from(_: wireguard_control::InvalidKey) -> Self {
        ServerError::InvalidKey
    }
}

impl From<wireguard_control::InvalidInterfaceName> for ServerError {
    fn from(e: wireguard_control::InvalidInterfaceName) -> Self {
        ServerError::Invalid(e.to_string())
    }
}

impl<'a> From<&'a ServerError> for StatusCode {
    fn from(error: &ServerError) -> StatusCode {
        use ServerError::*;
        match error {
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            NotFound => StatusCode::NOT_FOUND,
            // Every handler failure is surfaced as a 500 with the error text
            // in the result envelope.
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl TryFrom<ServerError> for Response<Body> {
    type Error = hyper::http::Error;

    fn try_from(e: ServerError) -> Result<Self, Self::Error> {
        let body = serde_json::json!({ "result": e.to_string() }).to_string();
        Response::builder()
            .status(StatusCode::from(&e))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
    }
}
