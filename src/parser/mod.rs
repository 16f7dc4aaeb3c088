pub mod blocks;
pub mod error;
pub mod hierarchy;
pub mod links;

use anyhow::{anyhow, Result};
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::db::FetchedPage;
use crate::settings::{Settings, Variant};
use hierarchy::DocumentStructure;

/// One emitted unit per crawled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub structure: DocumentStructure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Per-site content selection and code-block rules, compiled once per run.
#[derive(Debug, Clone)]
pub struct ContentRules {
    pub variant: Variant,
    pub highlighter_class: String,
    pub language_prefix: String,
    blocks: Selector,
    title: Selector,
    last_updated: Option<Selector>,
}

impl ContentRules {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if settings.content_selectors.is_empty() {
            anyhow::bail!("content_selectors is empty");
        }
        let blocks = parse_selector(&settings.content_selectors.join(", "))?;
        let last_updated = settings
            .last_updated_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;

        Ok(Self {
            variant: settings.variant,
            highlighter_class: settings.highlighter_class.clone(),
            language_prefix: settings.code_language_prefix.clone(),
            blocks,
            title: parse_selector("title")?,
            last_updated,
        })
    }

    /// True when the class attribute marks the element as highlighted code.
    pub fn is_highlighted(&self, class: &str) -> bool {
        class.split_whitespace().any(|c| c == self.highlighter_class)
    }
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {css:?}: {e}"))
}

/// Two passes per page: HTML → block elements → heading tree.
pub fn process_page(page: &FetchedPage, rules: &ContentRules) -> PageRecord {
    let visited = blocks::visit(&page.html, rules);
    let structure = hierarchy::build(&visited.blocks, rules, &page.url);

    let (title, last_updated) = match rules.variant {
        Variant::Basic => (None, None),
        Variant::CodeAware => (visited.title, visited.last_updated),
    };

    PageRecord {
        url: page.url.clone(),
        structure,
        title,
        last_updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Profile;

    fn fixture(name: &str, url: &str) -> FetchedPage {
        FetchedPage {
            page_data_id: 1,
            url: url.to_string(),
            html: std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap(),
        }
    }

    #[test]
    fn nextjs_page_record() {
        let rules = ContentRules::from_settings(&Profile::Nextjs.settings()).unwrap();
        let page = fixture("nextjs_routing", "https://nextjs.org/docs/app/routing");
        let record = process_page(&page, &rules);

        assert_eq!(record.url, "https://nextjs.org/docs/app/routing");
        assert!(record.title.is_none());
        assert!(record.last_updated.is_none());

        let roots = &record.structure.0;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].title, "Routing Fundamentals");
        let children: Vec<&str> = roots[0].subheadings.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(children, vec!["Terminology", "The app Router"]);
        assert_eq!(roots[0].subheadings[1].subheadings[0].title, "Roles of Folders and Files");
        // basic variant: no provenance on nodes
        assert!(roots[0].url.is_none());
        assert!(roots[0].section_id.is_none());
    }

    #[test]
    fn laravel_page_record() {
        let rules = ContentRules::from_settings(&Profile::Laravel.settings()).unwrap();
        let page = fixture("laravel_queues", "https://laravel.com/docs/11.x/queues");
        let record = process_page(&page, &rules);

        assert_eq!(record.title.as_deref(), Some("Queues - Laravel 11.x"));
        assert_eq!(record.last_updated.as_deref(), Some("Last updated: March 2024"));

        let roots = &record.structure.0;
        assert_eq!(roots[0].title, "No Heading");
        assert_eq!(roots[0].url.as_deref(), Some("https://laravel.com/docs/11.x/queues"));
        assert!(roots[0].section_id.is_none());

        let queues = &roots[1];
        assert_eq!(queues.title, "Queues");
        assert_eq!(queues.section_id.as_deref(), Some("queues"));
        let intro = &queues.subheadings[0];
        assert_eq!(intro.title, "Introduction");
        assert!(intro
            .content
            .iter()
            .any(|c| c == "```php\nphp artisan queue:work\n```"));
    }

    #[test]
    fn record_serializes_without_absent_fields() {
        let rules = ContentRules::from_settings(&Profile::Nextjs.settings()).unwrap();
        let page = FetchedPage {
            page_data_id: 1,
            url: "https://nextjs.org/docs".into(),
            html: "<h1>Docs</h1><p>Welcome</p>".into(),
        };
        let json = serde_json::to_value(process_page(&page, &rules)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "url": "https://nextjs.org/docs",
                "structure": [{"title": "Docs", "content": ["Welcome"], "subheadings": []}]
            })
        );
    }

    #[test]
    fn rejects_bad_selector() {
        let mut settings = Profile::Nextjs.settings();
        settings.content_selectors = vec!["p[".into()];
        assert!(ContentRules::from_settings(&settings).is_err());
    }
}
