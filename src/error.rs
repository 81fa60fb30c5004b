use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

// 想定内の拒否（ログは warn まで）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Forbidden,
    BadAddress,
    LoopDetected,
    PrivateNetwork,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::Forbidden => "Forbidden",
            Self::BadAddress => "Bad address",
            Self::LoopDetected => "Loop detected, proxy loading itself.",
            Self::PrivateNetwork => "Access to private network is denied.",
        }
    }
}

const GENERIC_FAILURE: &str = "Failed to proxy the requested page.";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{}", .0.message())]
    Rejected(Rejection),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not answer within {0}s")]
    Timeout(u64),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("failed to decompress {encoding} body: {source}")]
    Decompress {
        encoding: String,
        source: std::io::Error,
    },

    #[error("unsupported charset '{0}'")]
    Charset(String),

    #[error("failed to rewrite html: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),

    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("failed to build message: {0}")]
    Http(#[from] axum::http::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] axum::http::header::InvalidHeaderValue),
}

impl From<Rejection> for ProxyError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl ProxyError {
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Rejected(rejection) => Some(*rejection),
            _ => None,
        }
    }

    // 失敗はすべて 400 で返す
    pub fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    pub fn client_message(&self, expose_details: bool) -> String {
        match self {
            Self::Rejected(rejection) => rejection.message().to_string(),
            _ if expose_details => self.to_string(),
            _ => GENERIC_FAILURE.to_string(),
        }
    }

    /// Fresh error response; nothing from a partially built upstream response survives.
    pub fn into_client_response(self, expose_details: bool) -> Response {
        let body = self.client_message(expose_details);
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from(body),
        )
            .into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_client_response(false)
    }
}
