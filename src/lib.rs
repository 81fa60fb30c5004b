//! Same-origin mirroring proxy.
//!
//! Third-party pages are fetched through `{public_url}{proxy_prefix}{scheme}/{host}/...`
//! and every URL inside them is rewritten to point back through the proxy.

pub mod codec;
pub mod config;
pub mod error;
pub mod relay;
pub mod rewrite;
pub mod ssrf;
pub mod text_sample;
pub mod transcode;

use std::sync::Arc;

use axum::{body::Body, routing::any, Router};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::{codec::UrlCodec, config::ProxyConfig};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub codec: Arc<UrlCodec>,
    pub client: HttpClient,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            codec: Arc::new(UrlCodec::new(&config)),
            config: Arc::new(config),
            client: build_client(),
        }
    }
}

// http と https の両方を扱う共有クライアント（Cookie は保持しない）
pub fn build_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Every method under the prefix is relayed. Anything else goes through the
/// same handler, which rebuilds the target from the `Referer`.
pub fn router(state: AppState) -> Router {
    let route = format!("{}*rest", state.config.proxy_prefix);
    Router::new()
        .route(&route, any(relay::proxy_handler))
        .fallback(relay::proxy_handler)
        .with_state(state)
}
