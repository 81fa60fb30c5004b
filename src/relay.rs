//! Per-request relay: gate, resolve, guard, forward, transcode.

use std::{net::IpAddr, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{
            HeaderName, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_ENCODING,
            CONTENT_TYPE, LOCATION, PRAGMA, REFERER, USER_AGENT,
        },
        HeaderMap, Method, Uri,
    },
    response::Response,
};
use hyper::body::Incoming;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use url::{Host, Url};

use crate::{
    codec::{self, UrlCodec},
    config::ProxyConfig,
    error::{ProxyError, Rejection},
    rewrite::RewriteContext,
    ssrf,
    transcode::{transcode, TranscodeOptions},
    AppState,
};

const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate", "identity"];

/// Target of one relayed request. Created per request, never shared.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub target: Url,
    pub scheme: String,
    /// Host plus explicit port, as used inside proxy URLs.
    pub host: String,
    pub port: u16,
}

impl RelayContext {
    pub fn new(mut target: Url) -> Result<Self, ProxyError> {
        target.set_fragment(None);
        let host = codec::authority(&target)
            .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
        let port = target
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
        Ok(Self {
            scheme: target.scheme().to_string(),
            host,
            port,
            target,
        })
    }
}

pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let request_uri = req.uri().clone();
    match relay(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            match err.rejection() {
                Some(_) => warn!("⚠️ リクエストを拒否: {} ({})", request_uri, err),
                None => error!("❌ プロキシ失敗: {}: {:?}", request_uri, err),
            }
            err.into_client_response(state.config.expose_error_details)
        }
    }
}

async fn relay(state: &AppState, req: Request) -> Result<Response, ProxyError> {
    let config = &state.config;
    let (parts, body) = req.into_parts();
    let referer = parts
        .headers
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if config.enforce_access_checks {
        validate_referrer(config, referer.as_deref())?;
    }

    let target = resolve_target(&state.codec, &parts.uri, referer.as_deref())?;
    check_loop(&state.codec, &target)?;
    let context = RelayContext::new(target)?;

    let addresses = resolve_addresses(&context).await?;
    if config.enforce_access_checks && ssrf::is_private(addresses.iter().copied()) {
        return Err(Rejection::PrivateNetwork.into());
    }

    info!("🔄 プロキシ: {} {} -> {}", parts.method, parts.uri, context.target);

    let outbound = build_outbound(
        &state.codec,
        &context,
        parts.method,
        &parts.headers,
        referer.as_deref(),
        body,
    )?;

    // 書き換え対象の本文の読み込みまで同じ期限で打ち切る
    let secs = config.upstream_timeout_secs;
    let deadline = Instant::now() + Duration::from_secs(secs);
    let upstream = match timeout_at(deadline, state.client.request(outbound)).await {
        Ok(result) => result?,
        Err(_) => return Err(ProxyError::Timeout(secs)),
    };

    write_response(state, &context, upstream, deadline).await
}

/// Requests must come from a page served by this proxy or from an allowed host.
pub fn validate_referrer(config: &ProxyConfig, referer: Option<&str>) -> Result<(), Rejection> {
    let Some(referer) = referer else {
        return Err(Rejection::Forbidden);
    };
    // "https://proxy.example.com.evil.org" を通さないよう区切りまで見る
    let from_self = referer
        .strip_prefix(config.public_url.as_str())
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', '#']));
    let allowed = config
        .allowed_referrers
        .iter()
        .any(|prefix| referer.starts_with(prefix.as_str()));
    if from_self || allowed {
        Ok(())
    } else {
        Err(Rejection::Forbidden)
    }
}

/// Real URL for the request: decoded from the path, or rebuilt against the
/// page the request came from when the page used a path the rewriter missed.
pub fn resolve_target(codec: &UrlCodec, uri: &Uri, referer: Option<&str>) -> Result<Url, Rejection> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if let Some(target) = codec.decode(path_and_query) {
        return Ok(target);
    }

    let referer = referer.ok_or(Rejection::BadAddress)?;
    let page = codec
        .decode(referer)
        .or_else(|| Url::parse(referer).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .ok_or(Rejection::BadAddress)?;
    let target = page.join(path_and_query).map_err(|_| Rejection::BadAddress)?;
    warn!("⚠️ プロキシ URL ではないため Referer から復元: {} -> {}", path_and_query, target);
    Ok(target)
}

pub fn check_loop(codec: &UrlCodec, target: &Url) -> Result<(), Rejection> {
    if codec::starts_with_ignore_case(target.path(), codec.prefix()) {
        Err(Rejection::LoopDetected)
    } else {
        Ok(())
    }
}

async fn resolve_addresses(context: &RelayContext) -> Result<Vec<IpAddr>, Rejection> {
    let domain = match context.target.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => return Ok(vec![IpAddr::V4(ip)]),
        Some(Host::Ipv6(ip)) => return Ok(vec![IpAddr::V6(ip)]),
        None => return Err(Rejection::BadAddress),
    };

    let lookup = tokio::net::lookup_host((domain.as_str(), context.port)).await;
    match lookup {
        Ok(addrs) => {
            let addresses: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
            if addresses.is_empty() {
                error!("❌ 名前解決の結果が空: {}", domain);
                return Err(Rejection::BadAddress);
            }
            Ok(addresses)
        }
        Err(err) => {
            error!("❌ 名前解決に失敗: {}: {}", domain, err);
            Err(Rejection::BadAddress)
        }
    }
}

fn build_outbound(
    codec: &UrlCodec,
    context: &RelayContext,
    method: Method,
    headers: &HeaderMap,
    referer: Option<&str>,
    body: Body,
) -> Result<hyper::Request<Body>, ProxyError> {
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(context.target.as_str());

    // 上流へ転送するリクエストヘッダー（Cookie は送らない）
    let forwarded = [
        USER_AGENT,
        HeaderName::from_static("x-requested-with"),
        ACCEPT_LANGUAGE,
        ACCEPT,
        PRAGMA,
        CACHE_CONTROL,
    ];
    for name in forwarded {
        for value in headers.get_all(&name) {
            builder = builder.header(&name, value);
        }
    }

    if let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        builder = builder.header(CONTENT_TYPE, outbound_content_type(content_type));
    }

    if let Some(accept) = headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) {
        if let Some(filtered) = filter_accept_encoding(accept) {
            builder = builder.header(ACCEPT_ENCODING, filtered);
        }
    }

    if let Some(referer) = referer.and_then(|r| outbound_referer(codec, r)) {
        builder = builder.header(REFERER, referer);
    }

    Ok(builder.body(body)?)
}

/// Media type and every parameter, with `charset` re-emitted in a canonical form.
pub fn outbound_content_type(content_type: &str) -> String {
    let mut parts = content_type.split(';');
    let mut out = parts.next().unwrap_or_default().trim().to_string();
    for param in parts.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str("; ");
        match param.split_once('=') {
            Some((name, value)) if name.trim().eq_ignore_ascii_case("charset") => {
                out.push_str("charset=");
                out.push_str(value.trim());
            }
            _ => out.push_str(param),
        }
    }
    out
}

/// Keeps only the codings the transcoder can undo.
pub fn filter_accept_encoding(accept: &str) -> Option<String> {
    let kept: Vec<&str> = accept
        .split(',')
        .map(str::trim)
        .filter(|token| {
            let coding = token.split(';').next().unwrap_or_default().trim();
            SUPPORTED_ENCODINGS
                .iter()
                .any(|supported| coding.eq_ignore_ascii_case(supported))
        })
        .collect();
    (!kept.is_empty()).then(|| kept.join(", "))
}

// プロキシ経由のページからの Referer は実 URL に戻す。戻せなければ送らない
fn outbound_referer(codec: &UrlCodec, referer: &str) -> Option<String> {
    let path_end = referer.find('?').unwrap_or(referer.len());
    if codec::find_ignore_case(&referer[..path_end], codec.prefix()).is_some() {
        codec.decode(referer).map(String::from)
    } else {
        Some(referer.to_string())
    }
}

async fn write_response(
    state: &AppState,
    context: &RelayContext,
    upstream: hyper::Response<Incoming>,
    deadline: Instant,
) -> Result<Response, ProxyError> {
    let (parts, body) = upstream.into_parts();
    let mut builder = Response::builder().status(parts.status);

    for location in parts.headers.get_all(LOCATION) {
        if let Ok(value) = location.to_str() {
            let encoded = state.codec.encode(value, &context.scheme, &context.host, true);
            builder = builder.header(LOCATION, encoded);
        }
    }
    for name in [CACHE_CONTROL, PRAGMA] {
        for value in parts.headers.get_all(&name) {
            builder = builder.header(&name, value);
        }
    }

    let options = TranscodeOptions {
        ctx: RewriteContext {
            codec: &state.codec,
            scheme: &context.scheme,
            host: &context.host,
            proxy_static_assets: state.config.proxy_static_assets,
        },
        frame_target: &state.config.frame_target,
        text_sample: state.config.text_sample,
        deadline,
        timeout_secs: state.config.upstream_timeout_secs,
    };
    let transcoded = transcode(&parts.headers, body, &options).await?;

    if let Some(content_type) = transcoded.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    if let Some(content_encoding) = transcoded.content_encoding {
        builder = builder.header(CONTENT_ENCODING, content_encoding);
    }

    Ok(builder.body(transcoded.body)?)
}
