use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{ser::SerializeMap, Serialize};

use crate::webhook::InterpretError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("{0}")]
    BadWebhook(#[from] InterpretError),
    #[error("bad signature")]
    BadSignature,
    #[error("service {0:?} not found")]
    UnknownService(String),
    #[error("deployment {0} not found")]
    UnknownDeployment(i64),
    #[error("internal I/O error: {0}")]
    InputOutput(#[from] std::io::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Database(_) | Error::InputOutput(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadWebhook(e) => e.status(),
            Error::BadSignature => StatusCode::UNAUTHORIZED,
            Error::UnknownService(_) | Error::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &format!("{self:?}"))?;
        map.serialize_entry("msg", &self.to_string())?;
        map.end()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )],
            Json(self),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
