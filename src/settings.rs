use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "DOCS_CRAWLER";

/// Which extraction rules a site uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Headings, paragraphs and code as plain text; no provenance on nodes.
    Basic,
    /// Fenced code blocks, `url`/`section_id` on nodes, page title and last-updated.
    CodeAware,
}

/// Built-in site profiles, used as the base layer of the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    Nextjs,
    Laravel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub start_urls: Vec<String>,
    pub link_path_prefix: String,
    pub content_selectors: Vec<String>,
    pub code_language_prefix: String,
    pub variant: Variant,
    pub highlighter_class: String,
    #[serde(default)]
    pub last_updated_selector: Option<String>,
    #[serde(default)]
    pub sitemap_url: Option<String>,
    pub concurrency: usize,
    #[serde(default)]
    pub max_pages: Option<usize>,
    pub user_agent: String,
    pub db_path: PathBuf,
}

const BLOCK_SELECTORS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6", "p", "pre", "code"];

impl Profile {
    pub fn settings(self) -> Settings {
        let mut content_selectors: Vec<String> =
            BLOCK_SELECTORS.iter().map(|s| s.to_string()).collect();
        let (start_url, variant, last_updated) = match self {
            Profile::Nextjs => ("https://nextjs.org/docs", Variant::Basic, None),
            Profile::Laravel => {
                content_selectors.push(".syntax-highlighter".to_string());
                (
                    "https://laravel.com/docs/11.x",
                    Variant::CodeAware,
                    Some(".last-updated".to_string()),
                )
            }
        };

        Settings {
            start_urls: vec![start_url.to_string()],
            link_path_prefix: "/docs".to_string(),
            content_selectors,
            code_language_prefix: "language-".to_string(),
            variant,
            highlighter_class: "syntax-highlighter".to_string(),
            last_updated_selector: last_updated,
            sitemap_url: None,
            concurrency: 8,
            max_pages: None,
            user_agent: concat!("docs_crawler/", env!("CARGO_PKG_VERSION")).to_string(),
            db_path: PathBuf::from("data/docs.sqlite"),
        }
    }
}

/// Command-line values that win over every other layer.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub start_urls: Vec<String>,
    pub link_path_prefix: Option<String>,
    pub variant: Option<Variant>,
    pub concurrency: Option<usize>,
    pub db_path: Option<PathBuf>,
}

/// Layer settings: profile defaults, then an optional TOML file, then
/// `DOCS_CRAWLER_*` environment variables, then CLI overrides.
pub fn load(profile: Profile, file: Option<&Path>, overrides: Overrides) -> Result<Settings> {
    let defaults = Config::try_from(&profile.settings())?;
    let mut builder = Config::builder().add_source(defaults);
    if let Some(path) = file {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("start_urls")
            .with_list_parse_key("content_selectors"),
    );

    let mut settings: Settings = builder
        .build()
        .context("failed to assemble configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    apply(&mut settings, overrides);
    validate(&settings)?;
    Ok(settings)
}

fn apply(settings: &mut Settings, overrides: Overrides) {
    if !overrides.start_urls.is_empty() {
        settings.start_urls = overrides.start_urls;
    }
    if let Some(prefix) = overrides.link_path_prefix {
        settings.link_path_prefix = prefix;
    }
    if let Some(variant) = overrides.variant {
        settings.variant = variant;
    }
    if let Some(n) = overrides.concurrency {
        settings.concurrency = n;
    }
    if let Some(path) = overrides.db_path {
        settings.db_path = path;
    }
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.concurrency == 0 {
        anyhow::bail!("concurrency must be at least 1");
    }
    if !settings.link_path_prefix.starts_with('/') {
        anyhow::bail!(
            "link_path_prefix must start with '/', got {:?}",
            settings.link_path_prefix
        );
    }
    for url in &settings.start_urls {
        url::Url::parse(url).with_context(|| format!("invalid start URL {url}"))?;
    }
    Ok(())
}
