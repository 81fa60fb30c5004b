use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::RewriteContext;
use crate::codec::starts_with_ignore_case;

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(@import\s*['"])(.*?)(['"])"#).expect("valid regex"));

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(url\s*\(\s*['"]?)(.*?)(['"]?\s*\))"#).expect("valid regex")
});

/// Rewrites `@import "..."` and `url(...)` references in a stylesheet.
///
/// Only absolute, protocol-relative and root-relative references change; relative
/// paths already resolve against the proxied page location.
pub fn rewrite_css(css: &str, ctx: &RewriteContext<'_>) -> String {
    let replace = |caps: &Captures<'_>| {
        let url = &caps[2];
        let rewritten = if is_rewritable(url) {
            ctx.codec
                .encode(url, ctx.scheme, ctx.host, ctx.proxy_static_assets)
        } else {
            url.to_string()
        };
        format!("{}{}{}", &caps[1], rewritten, &caps[3])
    };

    let css = IMPORT_RE.replace_all(css, &replace);
    URL_RE.replace_all(&css, &replace).into_owned()
}

fn is_rewritable(url: &str) -> bool {
    starts_with_ignore_case(url, "http://")
        || starts_with_ignore_case(url, "https://")
        || url.starts_with('/')
}
