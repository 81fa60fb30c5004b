mod css;
mod html;
mod js;

pub use css::rewrite_css;
pub use html::{rewrite_html, HtmlRewriteOptions};
pub use js::rewrite_js;

use crate::codec::UrlCodec;

// 書き換え対象ページのスキーム・ホスト（ページ内の参照はこれを基準に解決する）
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    pub codec: &'a UrlCodec,
    pub scheme: &'a str,
    pub host: &'a str,
    pub proxy_static_assets: bool,
}
