//! Markup helpers shared by the feed mapper, the scraper and the reconcile path.

use scraper::node::Node;
use scraper::{Html, Selector};

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p",
    "pre", "section", "table", "td", "th", "tr", "ul",
];

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Strip markup from an HTML fragment and collapse whitespace.
///
/// Block-level elements act as word separators; script and style contents are dropped.
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len() / 2);

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(text) => {
                let skipped = node.ancestors().any(|ancestor| match ancestor.value() {
                    Node::Element(el) => SKIPPED_ELEMENTS.contains(&el.name()),
                    _ => false,
                });
                if !skipped {
                    out.push_str(text);
                }
            }
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => out.push(' '),
            _ => {}
        }
    }

    collapse_whitespace(&out)
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `src` of the first `<img>` in an HTML fragment.
pub fn first_image_src(html: &str) -> Option<String> {
    if html.trim().is_empty() {
        return None;
    }
    let selector = Selector::parse("img[src]").ok()?;
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty())
        .map(ToString::to_string)
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = collapse_whitespace(value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(text_or_none)
}
