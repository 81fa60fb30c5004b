//! Turns an upstream body into the body the client receives.
//!
//! HTML and CSS are buffered, decompressed, decoded in their declared charset,
//! rewritten and re-encoded. Everything else streams through untouched, including
//! its `Content-Encoding`.

use std::io::{self, Read};

use axum::{
    body::Body,
    http::{
        header::{CONTENT_ENCODING, CONTENT_TYPE},
        HeaderMap, HeaderValue,
    },
};
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::{
    error::ProxyError,
    rewrite::{rewrite_css, rewrite_html, HtmlRewriteOptions, RewriteContext},
    text_sample::extract_text_sample,
};

const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Html,
    Css,
    Passthrough,
}

impl BodyKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.map(media_type).as_deref() {
            Some("text/html") => Self::Html,
            Some("text/css") => Self::Css,
            _ => Self::Passthrough,
        }
    }
}

pub struct TranscodeOptions<'a> {
    pub ctx: RewriteContext<'a>,
    pub frame_target: &'a str,
    pub text_sample: bool,
    /// Buffering a body to rewrite it must finish before this instant.
    pub deadline: Instant,
    pub timeout_secs: u64,
}

pub struct Transcoded {
    pub body: Body,
    pub content_type: Option<HeaderValue>,
    pub content_encoding: Option<HeaderValue>,
}

pub async fn transcode(
    headers: &HeaderMap,
    body: Incoming,
    options: &TranscodeOptions<'_>,
) -> Result<Transcoded, ProxyError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let content_encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty() && v != "identity");

    let kind = BodyKind::from_content_type(content_type);
    let decodable = matches!(
        content_encoding.as_deref(),
        None | Some("gzip" | "x-gzip" | "deflate")
    );
    if kind == BodyKind::Passthrough || !decodable {
        return Ok(Transcoded {
            body: Body::new(body),
            content_type: headers.get(CONTENT_TYPE).cloned(),
            content_encoding: headers.get(CONTENT_ENCODING).cloned(),
        });
    }

    let charset = resolve_charset(content_type)?;
    let raw = timeout_at(options.deadline, body.collect())
        .await
        .map_err(|_| ProxyError::Timeout(options.timeout_secs))?
        .map_err(|e| ProxyError::Body(e.to_string()))?
        .to_bytes();
    let decoded = match content_encoding.as_deref() {
        Some(encoding) => decompress(&raw, encoding)?,
        None => raw.to_vec(),
    };

    let (bytes, charset_out) = match kind {
        BodyKind::Html => transcode_html(&decoded, charset, options)?,
        _ => transcode_css(&decoded, charset, &options.ctx),
    };

    let content_type = match (content_type, charset_out) {
        (Some(ct), Some(out)) => Some(HeaderValue::from_str(&with_charset(ct, out.name()))?),
        _ => headers.get(CONTENT_TYPE).cloned(),
    };

    Ok(Transcoded {
        body: Body::from(bytes),
        content_type,
        content_encoding: None,
    })
}

// 出力の文字コードが宣言と異なる場合のみ Some を返す
fn transcode_html(
    decoded: &[u8],
    charset: &'static Encoding,
    options: &TranscodeOptions<'_>,
) -> Result<(Vec<u8>, Option<&'static Encoding>), ProxyError> {
    if options.text_sample {
        let (text, _, _) = charset.decode(decoded);
        let sample = extract_text_sample(&text);
        debug!("📝 テキストサンプル: {} 文字", sample.chars().count());
    }

    let html_options = |encoding| HtmlRewriteOptions {
        ctx: options.ctx,
        frame_target: options.frame_target,
        encoding,
    };

    if charset.is_ascii_compatible() {
        return Ok((rewrite_html(decoded, &html_options(charset))?, None));
    }

    // UTF-16 などは UTF-8 に変換してから書き換える
    let (text, _, _) = charset.decode(decoded);
    let rewritten = rewrite_html(text.as_bytes(), &html_options(UTF_8))?;
    Ok((rewritten, Some(UTF_8)))
}

fn transcode_css(
    decoded: &[u8],
    charset: &'static Encoding,
    ctx: &RewriteContext<'_>,
) -> (Vec<u8>, Option<&'static Encoding>) {
    let (text, actual, _) = charset.decode(decoded);
    let rewritten = rewrite_css(&text, ctx);
    let output = actual.output_encoding();
    let (bytes, _, _) = output.encode(&rewritten);
    let changed = (output != charset).then_some(output);
    (bytes.into_owned(), changed)
}

/// Media type without parameters, lowercased.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// The `charset` parameter with quotes removed and `utf8` spelled `utf-8`.
pub fn charset_label(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let label = value.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if label.eq_ignore_ascii_case("utf8") {
            Some("utf-8".to_string())
        } else {
            Some(label.to_string())
        }
    })
}

pub fn resolve_charset(content_type: Option<&str>) -> Result<&'static Encoding, ProxyError> {
    match content_type.and_then(charset_label) {
        None => Ok(UTF_8),
        Some(label) => Encoding::for_label(label.as_bytes()).ok_or(ProxyError::Charset(label)),
    }
}

/// Replaces (or adds) the `charset` parameter, keeping every other parameter.
pub fn with_charset(content_type: &str, charset: &str) -> String {
    let mut parts = content_type.split(';');
    let mut out = parts.next().unwrap_or_default().trim().to_string();
    for param in parts.map(str::trim).filter(|p| !p.is_empty()) {
        let is_charset = param
            .split_once('=')
            .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("charset"));
        if !is_charset {
            out.push_str("; ");
            out.push_str(param);
        }
    }
    out.push_str("; charset=");
    out.push_str(charset);
    out
}

pub fn decompress(bytes: &[u8], encoding: &str) -> Result<Vec<u8>, ProxyError> {
    decompress_limited(bytes, encoding, MAX_DECOMPRESSED_SIZE)
}

fn decompress_limited(bytes: &[u8], encoding: &str, limit: u64) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::new();
    // 上限 + 1 バイトまで読み、超えたら展開爆弾として扱う
    let result = match encoding {
        "gzip" | "x-gzip" => GzDecoder::new(bytes).take(limit + 1).read_to_end(&mut out),
        // zlib ヘッダーなしの raw deflate を送るサーバーもある
        "deflate" => ZlibDecoder::new(bytes)
            .take(limit + 1)
            .read_to_end(&mut out)
            .or_else(|_| {
                out.clear();
                DeflateDecoder::new(bytes).take(limit + 1).read_to_end(&mut out)
            }),
        _ => return Ok(bytes.to_vec()),
    };
    let result = result.and_then(|read| {
        if read as u64 > limit {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decompressed body exceeds {limit} bytes"),
            ))
        } else {
            Ok(())
        }
    });
    result.map(|_| out).map_err(|source| ProxyError::Decompress {
        encoding: encoding.to_string(),
        source,
    })
}
