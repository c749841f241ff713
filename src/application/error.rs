use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    backend::InvokeError, config::LoadError, domain::KilnError, infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Error returned by request handlers: a short public body plus a detailed
/// report attached for the response logger.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<KilnError> for HttpError {
    fn from(error: KilnError) -> Self {
        let source = "application::error::kiln_error_to_http_error";
        match &error {
            KilnError::NotFound { .. } => {
                HttpError::from_error(source, StatusCode::NOT_FOUND, "Not found", &error)
            }
            KilnError::InvalidPath { .. } => {
                HttpError::from_error(source, StatusCode::BAD_REQUEST, "Invalid path", &error)
            }
            KilnError::Compile(_) => HttpError::from_error(
                source,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Handler failed to compile",
                &error,
            ),
            KilnError::TypeNotFound { .. } | KilnError::Instantiation { .. } => {
                HttpError::from_error(
                    source,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    &error,
                )
            }
        }
    }
}

impl From<InvokeError> for HttpError {
    fn from(error: InvokeError) -> Self {
        let source = "application::error::invoke_error_to_http_error";
        match &error {
            InvokeError::UnknownAction { .. } => {
                HttpError::from_error(source, StatusCode::NOT_FOUND, "Unknown action", &error)
            }
            InvokeError::Runtime { .. } => HttpError::from_error(
                source,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Kiln(#[from] KilnError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("unknown site `{0}`")]
    UnknownSite(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
