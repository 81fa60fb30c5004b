//! Visible-text sample of a page, intended as input for language detection.
//!
//! Nothing consumes the sample yet; the relay only logs its size when
//! `text_sample` is enabled. The rewritten output never depends on it.

use scraper::{ElementRef, Html, Node};

const SAMPLE_LIMIT: usize = 10_000;
const MIN_TRIM_LENGTH: usize = 300;
const SKIPPED_TAGS: &[&str] = &["script", "style", "var", "kbd", "samp", "code"];

pub fn extract_text_sample(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut collected = String::new();
    let mut chars = 0;
    collect_text(document.root_element(), &mut collected, &mut chars);

    let capped = chars >= SAMPLE_LIMIT;
    let text = collected.split_whitespace().collect::<Vec<_>>().join(" ");
    trim_header_and_footer(&text, capped)
}

// ヘッダー・フッターは英語が多いので前後 20% を落とす
fn trim_header_and_footer(text: &str, capped: bool) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= MIN_TRIM_LENGTH {
        return text.to_string();
    }
    let top = &chars[chars.len() / 5..];
    let kept = if capped {
        top
    } else {
        &top[..top.len() * 4 / 5]
    };
    kept.iter().collect()
}

fn collect_text(node: ElementRef<'_>, output: &mut String, chars: &mut usize) {
    for child in node.children() {
        if *chars >= SAMPLE_LIMIT {
            return;
        }
        match child.value() {
            Node::Text(text) => {
                output.push(' ');
                for c in text.chars().take(SAMPLE_LIMIT - *chars) {
                    output.push(c);
                    *chars += 1;
                }
                output.push(' ');
            }
            Node::Element(elem) => {
                let tag: &str = &elem.name.local;
                if SKIPPED_TAGS.contains(&tag) {
                    continue;
                }
                if let Some(element_ref) = ElementRef::wrap(child) {
                    collect_text(element_ref, output, chars);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_code_like_elements_and_decodes_entities() {
        let html = "<html><head><style>p{}</style></head><body><p>Fish &amp; chips</p>\
                    <script>var x = 1;</script><code>let y</code><kbd>Ctrl</kbd><p>today</p></body></html>";
        assert_eq!(extract_text_sample(html), "Fish & chips today");
    }

    #[test]
    fn short_text_is_not_trimmed() {
        assert_eq!(extract_text_sample("<p>  one\n two  </p>"), "one two");
    }

    #[test]
    fn long_text_loses_header_and_footer() {
        let text = "x".repeat(1000);
        let sample = trim_header_and_footer(&text, false);
        assert_eq!(sample.len(), 640);
        let capped = trim_header_and_footer(&text, true);
        assert_eq!(capped.len(), 800);
    }

    #[test]
    fn sample_is_capped() {
        let html = format!("<p>{}</p>", "word ".repeat(5_000));
        let sample = extract_text_sample(&html);
        assert!(sample.chars().count() <= SAMPLE_LIMIT);
    }
}
