use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::blocks::{language_token, BlockElement};
use super::error::ExtractError;
use super::ContentRules;
use crate::settings::Variant;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^h([1-6])$").unwrap());

pub const NO_HEADING: &str = "No Heading";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadingNode {
    pub title: String,
    /// Nesting depth while building; not part of the output.
    #[serde(skip)]
    pub level: u8,
    pub content: Vec<String>,
    pub subheadings: Vec<HeadingNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

impl HeadingNode {
    fn heading(title: String, level: u8) -> Self {
        Self {
            title,
            level,
            content: Vec::new(),
            subheadings: Vec::new(),
            url: None,
            section_id: None,
        }
    }

    fn orphan(text: String) -> Self {
        Self {
            content: vec![text],
            ..Self::heading(NO_HEADING.to_string(), 0)
        }
    }

    /// Pseudo-nodes are the only nodes built at level 0.
    pub fn is_orphan(&self) -> bool {
        self.level == 0 && self.title == NO_HEADING
    }
}

/// Root headings of a page plus `"No Heading"` nodes for leading content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentStructure(pub Vec<HeadingNode>);

impl DocumentStructure {
    /// Total number of nodes at every depth.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending: Vec<&HeadingNode> = self.0.iter().collect();
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.subheadings.iter());
        }
        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Heading(u8),
    Content,
}

/// Rebuild the heading tree from a flat, document-order block sequence.
///
/// A heading closes every open heading at the same or a deeper level and
/// becomes a child of whatever remains open. Content attaches to the
/// innermost open heading; before the first heading each content block gets
/// its own `"No Heading"` root.
pub fn build(elements: &[BlockElement], rules: &ContentRules, page_url: &str) -> DocumentStructure {
    let code_aware = rules.variant == Variant::CodeAware;
    let mut roots: Vec<HeadingNode> = Vec::new();
    // open headings, outermost first; a node is attached to its parent when it closes
    let mut stack: Vec<HeadingNode> = Vec::new();

    for element in elements {
        let (kind, text) = match classify(element, rules) {
            Ok(Some(classified)) => classified,
            Ok(None) => continue,
            Err(e) => {
                trace!("skipping element: {}", e);
                continue;
            }
        };

        match kind {
            Kind::Heading(level) => {
                close_to(&mut stack, &mut roots, level);
                let mut node = HeadingNode::heading(text, level);
                if code_aware {
                    node.url = Some(page_url.to_string());
                    node.section_id = Some(element.attr("id").unwrap_or("").to_string());
                }
                stack.push(node);
            }
            Kind::Content => match stack.last_mut() {
                Some(open) => open.content.push(text),
                None => {
                    let mut node = HeadingNode::orphan(text);
                    if code_aware {
                        node.url = Some(page_url.to_string());
                    }
                    roots.push(node);
                }
            },
        }
    }

    close_to(&mut stack, &mut roots, 0);
    DocumentStructure(roots)
}

/// Pop every open heading whose level is >= `level`, attaching each to the
/// heading below it or to the roots.
fn close_to(stack: &mut Vec<HeadingNode>, roots: &mut Vec<HeadingNode>, level: u8) {
    while stack.last().is_some_and(|top| top.level >= level) {
        let Some(node) = stack.pop() else { break };
        match stack.last_mut() {
            Some(parent) => parent.subheadings.push(node),
            None => roots.push(node),
        }
    }
}

fn classify(
    element: &BlockElement,
    rules: &ContentRules,
) -> Result<Option<(Kind, String)>, ExtractError> {
    let tag = element.tag.as_str();
    let class = element.class();
    let heading = HEADING_RE
        .captures(tag)
        .and_then(|caps| caps[1].parse::<u8>().ok());
    let is_code = matches!(tag, "pre" | "code") || rules.is_highlighted(class);

    let kind = match heading {
        Some(level) => Kind::Heading(level),
        None if tag == "p" || is_code => Kind::Content,
        None => return Ok(None),
    };

    if element.text.is_empty() {
        return Err(ExtractError::EmptyText {
            tag: tag.to_string(),
        });
    }

    let text = if is_code && rules.variant == Variant::CodeAware {
        fence(&element.text, class, &rules.language_prefix)
    } else {
        element.text.clone()
    };
    Ok(Some((kind, text)))
}

/// Wrap code as a fenced block, tagging the language when the class names one.
pub fn fence(text: &str, class: &str, language_prefix: &str) -> String {
    let lang = language_token(class, language_prefix)
        .map(|t| &t[language_prefix.len()..])
        .unwrap_or("");
    format!("```{}\n{}\n```", lang, text)
}
