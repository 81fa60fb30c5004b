//! Streaming HTML rewriting.
//!
//! The document is tokenized rather than parsed into a tree, so nothing is ever
//! auto-closed or re-nested: `<option>` runs and `<form>` elements come out exactly
//! as they went in. Only the attributes and raw text this module changes are
//! re-serialized; every other byte is copied through in the document's encoding.

use encoding_rs::Encoding;
use lol_html::{
    element,
    errors::RewritingError,
    html_content::{ContentType, Element, TextChunk},
    text, AsciiCompatibleEncoding, HandlerResult, HtmlRewriter, Settings,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{cell::Cell, rc::Rc};

use super::{rewrite_css, rewrite_js, RewriteContext};

// URL を含む要素・属性の一覧
const URL_ATTRIBUTES: &[(&str, &[&str])] = &[
    ("a", &["href"]),
    ("area", &["href"]),
    ("link", &["href"]),
    ("img", &["src", "longdesc", "srcset"]),
    ("object", &["codebase", "data"]),
    ("q", &["cite"]),
    ("blockquote", &["cite"]),
    ("ins", &["cite"]),
    ("del", &["cite"]),
    ("form", &["action"]),
    ("input", &["src"]),
    ("head", &["profile"]),
    ("script", &["src"]),
    ("iframe", &["src"]),
    ("base", &["href"]),
];

// 静的アセット無効時にオリジンから直接読み込ませる属性
const STATIC_ASSET_ATTRIBUTES: &[(&str, &str)] = &[
    ("link", "href"),
    ("script", "src"),
    ("img", "src"),
    ("img", "longdesc"),
    ("img", "srcset"),
];

const EVENT_ATTRIBUTES: &[&str] = &[
    "onclick",
    "ondblclick",
    "onmousedown",
    "onmouseup",
    "onmouseover",
    "onmousemove",
    "onmouseout",
    "onkeypress",
    "onkeydown",
    "onkeyup",
    "onfocus",
    "onblur",
    "onload",
    "onunload",
    "onsubmit",
    "onreset",
    "onselect",
    "onchange",
];

const SCRIPT_TYPES: &[&str] = &[
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "text/ecmascript",
    "text/jscript",
    "module",
];

static REFRESH_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)url\s*=").expect("valid regex"));

/// Settings for one rewrite pass. Built per document, never shared between requests.
#[derive(Debug, Clone, Copy)]
pub struct HtmlRewriteOptions<'a> {
    pub ctx: RewriteContext<'a>,
    pub frame_target: &'a str,
    /// Must be ASCII-compatible; anything else falls back to UTF-8.
    pub encoding: &'static Encoding,
}

impl HtmlRewriteOptions<'_> {
    fn can_proxy_to_self(&self, tag: &str, attribute: &str) -> bool {
        self.ctx.proxy_static_assets
            || !STATIC_ASSET_ATTRIBUTES
                .iter()
                .any(|&(t, a)| t == tag && a == attribute)
    }
}

pub fn rewrite_html(
    input: &[u8],
    options: &HtmlRewriteOptions<'_>,
) -> Result<Vec<u8>, RewritingError> {
    let mut output = Vec::with_capacity(input.len());

    let script_is_js = Rc::new(Cell::new(true));
    let style_is_css = Rc::new(Cell::new(true));
    let script_flag = script_is_js.clone();
    let style_flag = style_is_css.clone();
    let mut script_text = String::new();
    let mut style_text = String::new();
    let ctx = options.ctx;

    let encoding =
        AsciiCompatibleEncoding::new(options.encoding).unwrap_or_else(AsciiCompatibleEncoding::utf_8);

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("*", |el| rewrite_element(el, options)),
                element!("script", move |el| {
                    script_flag.set(is_script_type(el.get_attribute("type").as_deref()));
                    Ok(())
                }),
                element!("style", move |el| {
                    style_flag.set(is_style_type(el.get_attribute("type").as_deref()));
                    Ok(())
                }),
                text!("script", move |chunk| {
                    if script_is_js.get() {
                        rewrite_text_chunk(chunk, &mut script_text, |js| rewrite_js(js, &ctx));
                    }
                    Ok(())
                }),
                text!("style", move |chunk| {
                    if style_is_css.get() {
                        rewrite_text_chunk(chunk, &mut style_text, |css| rewrite_css(css, &ctx));
                    }
                    Ok(())
                }),
            ],
            encoding,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter.write(input)?;
    rewriter.end()?;
    Ok(output)
}

// テキストは複数チャンクに分かれて届くため、最後のチャンクでまとめて置換する
fn rewrite_text_chunk(chunk: &mut TextChunk<'_>, buffer: &mut String, rewrite: impl Fn(&str) -> String) {
    buffer.push_str(chunk.as_str());
    if chunk.last_in_text_node() {
        let rewritten = rewrite(buffer);
        chunk.replace(&rewritten, ContentType::Html);
        buffer.clear();
    } else {
        chunk.remove();
    }
}

fn rewrite_element(el: &mut Element<'_, '_>, options: &HtmlRewriteOptions<'_>) -> HandlerResult {
    let tag = el.tag_name().to_ascii_lowercase();
    let ctx = &options.ctx;

    let attributes = URL_ATTRIBUTES
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, attrs)| *attrs)
        .unwrap_or_default();
    for &attribute in attributes {
        let Some(value) = el.get_attribute(attribute) else {
            continue;
        };
        let can_proxy = options.can_proxy_to_self(&tag, attribute);
        let rewritten = if tag == "img" && attribute == "srcset" {
            rewrite_srcset(&value, ctx, can_proxy)
        } else {
            ctx.codec.encode(&value, ctx.scheme, ctx.host, can_proxy)
        };
        set_if_changed(el, attribute, &value, &rewritten)?;
    }

    if let Some(style) = el.get_attribute("style") {
        set_if_changed(el, "style", &style, &rewrite_css(&style, ctx))?;
    }

    for &attribute in EVENT_ATTRIBUTES {
        if let Some(handler) = el.get_attribute(attribute) {
            set_if_changed(el, attribute, &handler, &rewrite_js(&handler, ctx))?;
        }
    }

    match tag.as_str() {
        "a" => rewrite_anchor(el, options),
        "meta" => rewrite_meta_refresh(el, ctx),
        _ => Ok(()),
    }
}

fn rewrite_anchor(el: &mut Element<'_, '_>, options: &HtmlRewriteOptions<'_>) -> HandlerResult {
    if let Some(href) = el.get_attribute("href") {
        if href.trim_start().to_ascii_lowercase().starts_with("javascript:") {
            set_if_changed(el, "href", &href, &rewrite_js(&href, &options.ctx))?;
        }
    }

    // iframe の外に遷移させない
    if let Some(target) = el.get_attribute("target") {
        let target = target.trim();
        if target.eq_ignore_ascii_case("_top") || target.eq_ignore_ascii_case("_blank") {
            el.set_attribute("target", options.frame_target)?;
        }
    }

    if el
        .get_attribute("rel")
        .is_some_and(|rel| rel.trim().eq_ignore_ascii_case("external"))
    {
        el.remove_attribute("rel");
    }

    Ok(())
}

fn rewrite_meta_refresh(el: &mut Element<'_, '_>, ctx: &RewriteContext<'_>) -> HandlerResult {
    let is_refresh = el
        .get_attribute("http-equiv")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("refresh"));
    if !is_refresh {
        return Ok(());
    }
    let Some(content) = el.get_attribute("content") else {
        return Ok(());
    };
    let Some(found) = REFRESH_URL_RE.find(&content) else {
        return Ok(());
    };

    let target = content[found.end()..].trim();
    let quote = match target.chars().next() {
        Some(q @ ('\'' | '"')) => Some(q),
        _ => None,
    };
    let url = match quote {
        Some(q) => target.trim_matches(q),
        None => target,
    };
    let encoded = ctx.codec.encode(url, ctx.scheme, ctx.host, true);
    let rewritten = match quote {
        Some(q) => format!("{}url={q}{encoded}{q}", &content[..found.start()]),
        None => format!("{}url={encoded}", &content[..found.start()]),
    };
    set_if_changed(el, "content", &content, &rewritten)
}

// 各候補の先頭トークン（URL）だけを書き換え、記述子と区切りは残す
fn rewrite_srcset(value: &str, ctx: &RewriteContext<'_>, can_proxy_to_self: bool) -> String {
    value
        .split(',')
        .map(|candidate| {
            let start = candidate.len() - candidate.trim_start().len();
            let rest = &candidate[start..];
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            if end == 0 {
                return candidate.to_string();
            }
            format!(
                "{}{}{}",
                &candidate[..start],
                ctx.codec.encode(&rest[..end], ctx.scheme, ctx.host, can_proxy_to_self),
                &rest[end..]
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn set_if_changed(el: &mut Element<'_, '_>, name: &str, old: &str, new: &str) -> HandlerResult {
    if old != new {
        el.set_attribute(name, new)?;
    }
    Ok(())
}

fn is_script_type(value: Option<&str>) -> bool {
    match value.map(media_type) {
        None => true,
        Some(t) => t.is_empty() || SCRIPT_TYPES.contains(&t.as_str()),
    }
}

fn is_style_type(value: Option<&str>) -> bool {
    match value.map(media_type) {
        None => true,
        Some(t) => t.is_empty() || t == "text/css",
    }
}

fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::UrlCodec, config::ProxyConfig};

    const P: &str = "https://proxy.example.com/proxy/";

    fn rewrite_with(html: &str, proxy_static_assets: bool) -> String {
        let codec = UrlCodec::new(&ProxyConfig::new("https://proxy.example.com"));
        let options = HtmlRewriteOptions {
            ctx: RewriteContext {
                codec: &codec,
                scheme: "https",
                host: "site.org",
                proxy_static_assets,
            },
            frame_target: "hostFrame",
            encoding: encoding_rs::UTF_8,
        };
        String::from_utf8(rewrite_html(html.as_bytes(), &options).unwrap()).unwrap()
    }

    fn rewrite(html: &str) -> String {
        rewrite_with(html, true)
    }

    #[test]
    fn untouched_markup_is_byte_identical() {
        let html = "<!DOCTYPE html>\n<html><head><title>T &amp; U</title></head>\n<body class=x>\n<p>Hello <b>world</b><br/>\n<a href='page.html'>rel</a></p></body></html>";
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn rewrites_url_attributes() {
        let out = rewrite(r#"<a href="/news?id=1">n</a><iframe src="http://other.net/w"></iframe><form action="/search"></form>"#);
        assert_eq!(
            out,
            format!(
                r#"<a href="{P}https/site.org/news?id=1">n</a><iframe src="{P}http/other.net/w"></iframe><form action="{P}https/site.org/search"></form>"#
            )
        );
    }

    #[test]
    fn option_and_form_structure_survives() {
        let html = r#"<form action="page"><select name="s"><option>a<option selected>b</select></form><p>after</p>"#;
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn srcset_keeps_descriptors() {
        let out = rewrite(r#"<img srcset="/a.jpg 1x, /b.jpg 2x">"#);
        assert_eq!(
            out,
            format!(r#"<img srcset="{P}https/site.org/a.jpg 1x, {P}https/site.org/b.jpg 2x">"#)
        );

        let relative = r#"<img srcset="a.jpg 1x, b.jpg 2x">"#;
        assert_eq!(rewrite(relative), relative);
    }

    #[test]
    fn static_assets_stay_on_origin_when_disabled() {
        let out = rewrite_with(
            r#"<link href="/s.css"><script src="/app.js"></script><img src="/i.png"><a href="/p">p</a>"#,
            false,
        );
        assert_eq!(
            out,
            format!(
                r#"<link href="https://site.org/s.css"><script src="https://site.org/app.js"></script><img src="https://site.org/i.png"><a href="{P}https/site.org/p">p</a>"#
            )
        );
    }

    #[test]
    fn rewrites_meta_refresh() {
        let out = rewrite(r#"<meta http-equiv="refresh" content="5; URL='/next'">"#);
        assert_eq!(
            out,
            format!(r#"<meta http-equiv="refresh" content="5; url='{P}https/site.org/next'">"#)
        );

        let no_url = r#"<meta http-equiv="refresh" content="30">"#;
        assert_eq!(rewrite(no_url), no_url);
    }

    #[test]
    fn delegates_style_text_and_attributes() {
        let out = rewrite(r#"<style>body{background:url(/bg.png)}</style><div style="background:url('/d.png')"></div>"#);
        assert_eq!(
            out,
            format!(
                r#"<style>body{{background:url({P}https/site.org/bg.png)}}</style><div style="background:url('{P}https/site.org/d.png')"></div>"#
            )
        );
    }

    #[test]
    fn delegates_inline_scripts_by_type() {
        let out = rewrite(r#"<script>var a = "http://api.site.org/x";</script>"#);
        assert_eq!(out, format!(r#"<script>var a = "{P}http/api.site.org/x";</script>"#));

        let json = r#"<script type="application/ld+json">{"url": "http://site.org/"}</script>"#;
        assert_eq!(rewrite(json), json);
    }

    #[test]
    fn delegates_event_handlers() {
        let out = rewrite(r#"<button onclick="go('https://site.org/buy')">b</button>"#);
        assert_eq!(
            out,
            format!(r#"<button onclick="go('{P}https/site.org/buy')">b</button>"#)
        );
    }

    #[test]
    fn anchors_stay_in_frame() {
        let out = rewrite(r#"<a href="javascript:open('http://x.org/')" target="_blank" rel="external">x</a>"#);
        assert_eq!(
            out,
            format!(r#"<a href="javascript:open('{P}http/x.org/')" target="hostFrame">x</a>"#)
        );

        let kept = r#"<a href="page" target="_self" rel="nofollow">y</a>"#;
        assert_eq!(rewrite(kept), kept);
    }

    #[test]
    fn keeps_legacy_encoding_bytes() {
        let codec = UrlCodec::new(&ProxyConfig::new("https://proxy.example.com"));
        let options = HtmlRewriteOptions {
            ctx: RewriteContext {
                codec: &codec,
                scheme: "http",
                host: "site.org",
                proxy_static_assets: true,
            },
            frame_target: "hostFrame",
            encoding: encoding_rs::WINDOWS_1252,
        };
        let mut input = b"<p>caf".to_vec();
        input.push(0xE9);
        input.extend_from_slice(b"</p><a href=\"/x\">x</a>");
        let out = rewrite_html(&input, &options).unwrap();

        let mut expected = b"<p>caf".to_vec();
        expected.push(0xE9);
        expected.extend_from_slice(format!("</p><a href=\"{P}http/site.org/x\">x</a>").as_bytes());
        assert_eq!(out, expected);
    }
}
