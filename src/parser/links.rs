use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tracing::debug;
use url::Url;

use super::error::ExtractError;

/// Crawl-wide set of URLs that were fetched or already scheduled.
///
/// Shared between fetch workers; `claim` tests and inserts under one lock so
/// two workers never schedule the same page.
#[derive(Debug, Default)]
pub struct VisitedSet {
    inner: Mutex<HashSet<String>>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Mutex::new(urls.into_iter().map(Into::into).collect()),
        }
    }

    /// Insert `url`; false when it was already present.
    pub fn claim(&self, url: &str) -> bool {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Resolve `href` against the page and drop the fragment, so `/docs/a#x`
/// and `/docs/a` name the same page.
pub fn resolve(page_url: &Url, href: &str) -> Result<Url, ExtractError> {
    let mut url = page_url
        .join(href.trim())
        .map_err(|source| ExtractError::MalformedHref {
            href: href.to_string(),
            source,
        })?;
    url.set_fragment(None);
    Ok(url)
}

/// Same-site documentation links from one page that nobody has claimed yet.
///
/// Every returned URL has been inserted into `visited`. Output follows href
/// order.
pub fn discover<S: AsRef<str>>(
    page_url: &Url,
    hrefs: &[S],
    path_prefix: &str,
    visited: &VisitedSet,
) -> Vec<Url> {
    let mut found = Vec::new();

    for href in hrefs {
        let url = match resolve(page_url, href.as_ref()) {
            Ok(url) => url,
            Err(e) => {
                debug!("{}: {}", page_url, e);
                continue;
            }
        };

        if !is_doc_link(page_url, &url, path_prefix) {
            continue;
        }
        if visited.claim(url.as_str()) {
            found.push(url);
        }
    }

    found
}

fn is_doc_link(page_url: &Url, url: &Url, path_prefix: &str) -> bool {
    matches!(url.scheme(), "http" | "https")
        && url.host_str() == page_url.host_str()
        && url.path().starts_with(path_prefix)
}
