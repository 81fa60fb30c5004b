use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::RewriteContext;

// "http(s)://..." / 'http(s)://...'
static ABSOLUTE_LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(https?://[^"\n]*)"|'(https?://[^'\n]*)'"#).expect("valid regex")
});

// window.location.href = "/path"
static ROOT_REDIRECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(\s*window\.location\.href\s*=\s*)(["'])(\s*)(/[^"'\n]*)(["'])"#)
        .expect("valid regex")
});

/// Conservative URL rewriting for inline scripts and event handler attributes.
///
/// Only quoted absolute URL literals and root-relative `window.location.href`
/// assignments are touched. Any other string could be something other than a URL.
pub fn rewrite_js(js: &str, ctx: &RewriteContext<'_>) -> String {
    let js = ABSOLUTE_LITERAL_RE.replace_all(js, |caps: &Captures<'_>| {
        let (quote, url) = match (caps.get(1), caps.get(2)) {
            (Some(url), _) => ('"', url.as_str()),
            (None, Some(url)) => ('\'', url.as_str()),
            (None, None) => return caps[0].to_string(),
        };
        format!("{quote}{}{quote}", ctx.codec.encode(url, ctx.scheme, ctx.host, true))
    });

    ROOT_REDIRECT_RE
        .replace_all(&js, |caps: &Captures<'_>| {
            if caps[2] != caps[5] {
                return caps[0].to_string();
            }
            format!(
                "{}{}{}{}{}",
                &caps[1],
                &caps[2],
                &caps[3],
                ctx.codec.encode(&caps[4], ctx.scheme, ctx.host, true),
                &caps[5]
            )
        })
        .into_owned()
}
