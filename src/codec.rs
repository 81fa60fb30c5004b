//! Translation between real third-party URLs and same-origin proxy URLs.
//!
//! A proxy URL has the shape `{public_url}{proxy_prefix}{scheme}/{host}{path}?{query}`.
//! Encoding never fails: anything it cannot classify or parse is returned as-is.

use url::Url;

use crate::config::ProxyConfig;

#[derive(Debug, Clone)]
pub struct UrlCodec {
    // public_url + proxy_prefix
    base: String,
    prefix: String,
}

impl UrlCodec {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            base: format!("{}{}", config.public_url, config.proxy_prefix),
            prefix: config.proxy_prefix.clone(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Rewrites `url` so that it is loaded through the proxy.
    ///
    /// `context_scheme` and `context_host` describe the page the reference was found
    /// in. With `can_proxy_to_self` off, root-relative paths are only made absolute
    /// against the origin, and absolute URLs are left alone.
    pub fn encode(
        &self,
        url: &str,
        context_scheme: &str,
        context_host: &str,
        can_proxy_to_self: bool,
    ) -> String {
        let trimmed = url.trim();

        if trimmed.starts_with("//") {
            let Ok(parsed) = Url::parse(&format!("{context_scheme}:{trimmed}")) else {
                return url.to_string();
            };
            let Some(host) = authority(&parsed) else {
                return url.to_string();
            };
            if can_proxy_to_self && host.eq_ignore_ascii_case(context_host) {
                return self.proxied(context_scheme, &host, &parsed);
            }
            // 別ドメインのリソースはそのまま
            return url.to_string();
        }

        if trimmed.starts_with('/') {
            if can_proxy_to_self {
                return format!("{}{}/{}{}", self.base, context_scheme, context_host, trimmed);
            }
            return format!("{context_scheme}://{context_host}{trimmed}");
        }

        let scheme = if starts_with_ignore_case(trimmed, "http://") {
            "http"
        } else if starts_with_ignore_case(trimmed, "https://") {
            "https"
        } else {
            // 相対パス、mailto:、data:、#fragment など
            return url.to_string();
        };

        let Ok(parsed) = Url::parse(trimmed) else {
            return url.to_string();
        };
        let Some(host) = authority(&parsed) else {
            return url.to_string();
        };
        if can_proxy_to_self {
            self.proxied(scheme, &host, &parsed)
        } else {
            url.to_string()
        }
    }

    /// Recovers the real URL from a proxy URL or a proxy path-and-query.
    ///
    /// Returns `None` when the prefix is missing, the segment after it is not
    /// exactly `http` or `https`, or the rebuilt URL does not parse.
    pub fn decode(&self, proxy_url: &str) -> Option<Url> {
        let path_and_query = if proxy_url.starts_with('/') {
            proxy_url.to_string()
        } else {
            let parsed = Url::parse(proxy_url).ok()?;
            match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            }
        };

        let path_end = path_and_query.find('?').unwrap_or(path_and_query.len());
        let start = find_ignore_case(&path_and_query[..path_end], &self.prefix)? + self.prefix.len();
        let rest = &path_and_query[start..];
        let (scheme, target) = rest.split_once('/')?;
        if scheme != "http" && scheme != "https" {
            return None;
        }

        let url = Url::parse(&format!("{scheme}://{target}")).ok()?;
        url.host_str()?;
        Some(url)
    }

    fn proxied(&self, scheme: &str, host: &str, parsed: &Url) -> String {
        let mut out = format!("{}{}/{}{}", self.base, scheme, host, parsed.path());
        if let Some(query) = parsed.query() {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = parsed.fragment() {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// Host plus an explicit, non-default port.
pub fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

pub(crate) fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

pub(crate) fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> UrlCodec {
        UrlCodec::new(&ProxyConfig::new("https://proxy.example.com"))
    }

    #[test]
    fn absolute_url_round_trips() {
        let codec = codec();
        let encoded = codec.encode("http://example.com/a?b=1", "https", "unrelated.org", true);
        assert_eq!(encoded, "https://proxy.example.com/proxy/http/example.com/a?b=1");
        assert_eq!(codec.decode(&encoded).unwrap().as_str(), "http://example.com/a?b=1");
    }

    #[test]
    fn root_relative_uses_context() {
        let codec = codec();
        assert_eq!(
            codec.encode("/p/q", "https", "x.com", true),
            "https://proxy.example.com/proxy/https/x.com/p/q"
        );
        assert_eq!(codec.encode("/p/q", "https", "x.com", false), "https://x.com/p/q");
    }

    #[test]
    fn protocol_relative_only_for_same_host() {
        let codec = codec();
        assert_eq!(
            codec.encode("//x.com/lib.js?v=2", "https", "x.com", true),
            "https://proxy.example.com/proxy/https/x.com/lib.js?v=2"
        );
        assert_eq!(
            codec.encode("//cdn.other.net/lib.js", "https", "x.com", true),
            "//cdn.other.net/lib.js"
        );
        assert_eq!(codec.encode("//x.com/lib.js", "https", "x.com", false), "//x.com/lib.js");
    }

    #[test]
    fn absolute_without_self_proxy_is_unchanged() {
        let codec = codec();
        let url = "https://cdn.example.com/a.png";
        assert_eq!(codec.encode(url, "https", "x.com", false), url);
    }

    #[test]
    fn keeps_explicit_port_and_fragment() {
        let codec = codec();
        let encoded = codec.encode("http://example.com:8080/doc#part", "https", "x.com", true);
        assert_eq!(encoded, "https://proxy.example.com/proxy/http/example.com:8080/doc#part");
        let decoded = codec.decode("/proxy/http/example.com:8080/doc").unwrap();
        assert_eq!(decoded.port(), Some(8080));
    }

    #[test]
    fn passes_through_unclassified_input() {
        let codec = codec();
        for input in ["page.html", "../up.css", "mailto:a@b.c", "data:image/png;base64,AA", "#top", ""] {
            assert_eq!(codec.encode(input, "https", "x.com", true), input);
        }
    }

    #[test]
    fn parse_failure_is_fail_open() {
        let codec = codec();
        assert_eq!(codec.encode("http://", "https", "x.com", true), "http://");
        assert_eq!(codec.encode("https://exa mple.com/", "https", "x.com", true), "https://exa mple.com/");
    }

    #[test]
    fn decode_rejects_bad_input() {
        let codec = codec();
        assert!(codec.decode("/elsewhere/http/example.com/").is_none());
        assert!(codec.decode("/proxy/ftp/example.com/file").is_none());
        assert!(codec.decode("/proxy/http").is_none());
        assert!(codec.decode("/proxy/https/").is_none());
        assert!(codec.decode("/page?next=/proxy/http/example.com/").is_none());
    }

    #[test]
    fn decode_accepts_absolute_proxy_url() {
        let codec = codec();
        let decoded = codec
            .decode("https://proxy.example.com/PROXY/https/site.org/news/?id=7")
            .unwrap();
        assert_eq!(decoded.as_str(), "https://site.org/news/?id=7");
    }
}
