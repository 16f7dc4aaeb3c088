use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};

use super::ContentRules;

/// Attributes carried through to the hierarchy builder.
const KEPT_ATTRIBUTES: &[&str] = &["id", "class"];

/// One candidate block of a page, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockElement {
    pub tag: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

impl BlockElement {
    pub fn new(tag: &str, text: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: text.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn class(&self) -> &str {
        self.attr("class").unwrap_or("")
    }
}

/// Everything the process phase needs from one page's DOM.
#[derive(Debug, Default)]
pub struct VisitedPage {
    pub blocks: Vec<BlockElement>,
    pub title: Option<String>,
    pub last_updated: Option<String>,
}

/// Walk the page and collect matching blocks in document order.
///
/// An element nested inside another matched element (`<code>` inside `<pre>`,
/// inline `<code>` inside `<p>`) is not emitted on its own; its text already
/// belongs to the enclosing block.
pub fn visit(html: &str, rules: &ContentRules) -> VisitedPage {
    let document = Html::parse_document(html);

    let blocks = document
        .select(&rules.blocks)
        .filter(|el| !has_matched_ancestor(el, &rules.blocks))
        .map(|el| to_block(&el, rules))
        .collect();

    VisitedPage {
        blocks,
        title: first_text(&document, &rules.title),
        last_updated: rules
            .last_updated
            .as_ref()
            .and_then(|sel| first_text(&document, sel)),
    }
}

/// Raw `href` values of every anchor, in document order.
pub fn anchor_hrefs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect()
}

fn has_matched_ancestor(el: &ElementRef<'_>, selector: &Selector) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| selector.matches(&ancestor))
}

fn to_block(el: &ElementRef<'_>, rules: &ContentRules) -> BlockElement {
    let tag = el.value().name().to_ascii_lowercase();
    let class = el.value().attr("class").unwrap_or("");
    let raw: String = el.text().collect();

    let is_code = matches!(tag.as_str(), "pre" | "code") || rules.is_highlighted(class);

    // code keeps its line structure; prose is reflowed onto one line
    let text = if is_code {
        raw.trim().to_string()
    } else {
        collapse_whitespace(&raw)
    };

    let mut attributes: BTreeMap<String, String> = KEPT_ATTRIBUTES
        .iter()
        .filter_map(|name| {
            el.value()
                .attr(name)
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    if is_code && language_token(class, &rules.language_prefix).is_none() {
        if let Some(lang) = nested_language(el, &rules.language_prefix) {
            let merged = format!("{class} {lang}").trim().to_string();
            attributes.insert("class".to_string(), merged);
        }
    }

    BlockElement {
        tag,
        text,
        attributes,
    }
}

/// First class token carrying the language prefix, e.g. `language-js`.
pub fn language_token<'a>(class: &'a str, prefix: &str) -> Option<&'a str> {
    class
        .split_whitespace()
        .find(|t| t.len() > prefix.len() && t.starts_with(prefix))
}

/// `<pre><code class="language-x">`: the language sits on a folded child.
fn nested_language(el: &ElementRef<'_>, prefix: &str) -> Option<String> {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .filter_map(|d| d.value().attr("class"))
        .find_map(|c| language_token(c, prefix))
        .map(str::to_string)
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
