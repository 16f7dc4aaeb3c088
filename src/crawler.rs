use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{self, FetchRow, QueuedPage};
use crate::parser::blocks;
use crate::parser::links::{self, VisitedSet};
use crate::settings::Settings;
use crate::sitemap;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FetcherKind {
    /// Plain HTTP GET.
    Http,
    /// spider.cloud, raw HTML (needs SPIDER_API_KEY).
    Spider,
}

pub enum Fetcher {
    Http(reqwest::Client),
    Spider(Spider),
    #[cfg(test)]
    Fixture {
        pages: std::collections::HashMap<String, String>,
        redirects: std::collections::HashMap<String, String>,
    },
}

struct Fetched {
    /// Where the body was served from after redirects, when the backend reports it.
    url: Option<String>,
    status: Option<u16>,
    html: Option<String>,
}

impl Fetcher {
    pub fn new(kind: FetcherKind, settings: &Settings) -> Result<Self> {
        match kind {
            FetcherKind::Http => Ok(Self::Http(http_client(settings)?)),
            FetcherKind::Spider => {
                let api_key = std::env::var("SPIDER_API_KEY")
                    .map_err(|_| anyhow!("SPIDER_API_KEY environment variable must be set"))?;
                let spider = Spider::new(Some(api_key))
                    .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
                Ok(Self::Spider(spider))
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Fetched> {
        match self {
            Self::Http(client) => {
                let response = client.get(url).send().await?;
                let served = response.url().to_string();
                let status = response.status().as_u16();
                let html = response.text().await?;
                Ok(Fetched {
                    url: Some(served),
                    status: Some(status),
                    html: Some(html),
                })
            }
            Self::Spider(spider) => fetch_via_spider(spider, url).await,
            #[cfg(test)]
            Self::Fixture { pages, redirects } => {
                let served = redirects.get(url).map_or(url, String::as_str);
                Ok(Fetched {
                    url: Some(served.to_string()),
                    status: Some(if pages.contains_key(served) { 200 } else { 404 }),
                    html: pages.get(served).cloned(),
                })
            }
        }
    }
}

pub fn http_client(settings: &Settings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(settings.user_agent.as_str())
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

async fn fetch_via_spider(spider: &Spider, url: &str) -> Result<Fetched> {
    let params = RequestParams {
        return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
        ..Default::default()
    };

    let value = spider
        .scrape_url(url, Some(params), "application/json")
        .await
        .map_err(|e| anyhow!("Spider scrape failed: {}", e))?;

    let parsed: serde_json::Value = match value.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
        None => value,
    };
    let first = parsed.as_array().and_then(|arr| arr.first());

    let html = first
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let status = first
        .and_then(|obj| obj.get("status"))
        .and_then(|s| s.as_u64())
        .and_then(|s| u16::try_from(s).ok());
    let served = first
        .and_then(|obj| obj.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    Ok(Fetched {
        url: served,
        status,
        html,
    })
}

/// Queue the start URLs, plus sitemap entries under the link prefix.
pub async fn seed(conn: &Connection, settings: &Settings) -> Result<usize> {
    let mut urls = Vec::new();
    let mut hosts: Vec<String> = Vec::new();
    for raw in &settings.start_urls {
        let mut url = Url::parse(raw)?;
        url.set_fragment(None);
        if let Some(host) = url.host_str() {
            if !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
        urls.push(String::from(url));
    }

    if let Some(sitemap_url) = &settings.sitemap_url {
        let client = http_client(settings)?;
        let found = sitemap::fetch_doc_urls(
            &client,
            sitemap_url,
            &hosts,
            &settings.link_path_prefix,
        )
        .await?;
        urls.extend(found);
    }

    let inserted = db::insert_pages(conn, &urls, 0)?;
    info!("Queued {} new URLs ({} candidates)", inserted, urls.len());
    Ok(inserted)
}

pub struct CrawlStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    pub discovered: usize,
}

/// Fetch queued pages concurrently, saving each result as it arrives and
/// queueing the documentation links it discovers.
///
/// `limit` (or `max_pages`) caps the number of fetches in this run; links
/// found beyond the cap stay queued for the next one.
pub async fn crawl(
    conn: &Connection,
    settings: &Settings,
    fetcher: Fetcher,
    limit: Option<usize>,
) -> Result<CrawlStats> {
    let mut queue: VecDeque<QueuedPage> = db::fetch_unvisited(conn, None)?.into();
    let visited = Arc::new(VisitedSet::from_urls(db::all_urls(conn)?));
    let budget = limit.or(settings.max_pages).unwrap_or(usize::MAX);

    let fetcher = Arc::new(fetcher);
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let prefix: Arc<str> = Arc::from(settings.link_path_prefix.as_str());

    let pb = ProgressBar::new(queue.len().min(budget) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Channel: workers send results, this loop saves them and feeds the queue
    let (tx, mut rx) = mpsc::channel::<FetchRow>(settings.concurrency * 2);

    let mut insert_stmt = conn.prepare(db::INSERT_PAGE_DATA)?;
    let mut update_stmt = conn.prepare(db::MARK_VISITED)?;

    let mut dispatched = 0usize;
    let mut in_flight = 0usize;
    let mut ok = 0usize;
    let mut errors = 0usize;
    let mut discovered = 0usize;

    loop {
        while dispatched < budget {
            let Some(page) = queue.pop_front() else { break };
            let fetcher = Arc::clone(&fetcher);
            let sem = Arc::clone(&semaphore);
            let visited = Arc::clone(&visited);
            let prefix = Arc::clone(&prefix);
            let tx = tx.clone();

            tokio::spawn(async move {
                let row = match sem.acquire().await {
                    Ok(_permit) => fetch_page(&fetcher, page, &visited, &prefix).await,
                    Err(e) => failed_row(page, e.to_string(), None),
                };
                let _ = tx.send(row).await;
            });
            dispatched += 1;
            in_flight += 1;
        }

        if in_flight == 0 {
            break;
        }
        let Some(row) = rx.recv().await else { break };
        in_flight -= 1;

        match &row.error {
            Some(e) => {
                errors += 1;
                warn!("Fetch failed for {}: {}", row.url, e);
            }
            None => ok += 1,
        }

        db::save_fetch(&mut insert_stmt, &mut update_stmt, &row)?;
        let added = db::insert_discovered(conn, &row.discovered, row.depth + 1)?;
        if !added.is_empty() {
            debug!("{}: {} new links", row.url, added.len());
        }
        let room = budget.saturating_sub(dispatched + queue.len());
        pb.inc_length(added.len().min(room) as u64);
        discovered += added.len();
        queue.extend(added);
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Fetched {} pages ({} ok, {} errors), discovered {} links, {} URLs known",
        dispatched,
        ok,
        errors,
        discovered,
        visited.len()
    );

    Ok(CrawlStats {
        total: dispatched,
        ok,
        errors,
        discovered,
    })
}

async fn fetch_page(
    fetcher: &Fetcher,
    page: QueuedPage,
    visited: &VisitedSet,
    prefix: &str,
) -> FetchRow {
    let start = Instant::now();
    let result = fetcher.fetch(&page.url).await;
    let latency_ms = Some(start.elapsed().as_millis() as i64);

    let fetched = match result {
        Ok(fetched) => fetched,
        Err(e) => return failed_row(page, e.to_string(), latency_ms),
    };
    let status = fetched.status.map(i32::from);

    let html = match (fetched.status, fetched.html) {
        (Some(code), _) if !(200..300).contains(&code) => {
            let mut row = failed_row(page, format!("HTTP {}", code), latency_ms);
            row.status = status;
            return row;
        }
        (_, None) => {
            let mut row = failed_row(page, "empty response".to_string(), latency_ms);
            row.status = status;
            return row;
        }
        (_, Some(html)) => html,
    };

    // after a redirect, links resolve against and the record carries the served URL
    let served = served_url(&page.url, fetched.url.as_deref());
    if served != page.url && !visited.claim(&served) {
        debug!("{} redirects to already-seen {}", page.url, served);
        return FetchRow {
            page_id: page.page_id,
            url: served,
            depth: page.depth,
            html: None,
            status,
            error: None,
            latency_ms,
            discovered: Vec::new(),
        };
    }

    let discovered = discover_links(&served, &html, prefix, visited);
    FetchRow {
        page_id: page.page_id,
        url: served,
        depth: page.depth,
        html: Some(html),
        status,
        error: None,
        latency_ms,
        discovered,
    }
}

fn served_url(requested: &str, reported: Option<&str>) -> String {
    match reported.map(Url::parse) {
        Some(Ok(mut url)) => {
            url.set_fragment(None);
            String::from(url)
        }
        _ => requested.to_string(),
    }
}

fn discover_links(page_url: &str, html: &str, prefix: &str, visited: &VisitedSet) -> Vec<String> {
    let base = match Url::parse(page_url) {
        Ok(base) => base,
        Err(e) => {
            warn!("Not following links from {}: {}", page_url, e);
            return Vec::new();
        }
    };
    let hrefs = blocks::anchor_hrefs(html);
    links::discover(&base, &hrefs, prefix, visited)
        .into_iter()
        .map(String::from)
        .collect()
}

fn failed_row(page: QueuedPage, error: String, latency_ms: Option<i64>) -> FetchRow {
    FetchRow {
        page_id: page.page_id,
        url: page.url,
        depth: page.depth,
        html: None,
        status: None,
        error: Some(error),
        latency_ms,
        discovered: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Profile;
    use std::collections::HashMap;

    fn site() -> Fetcher {
        let pages: HashMap<String, String> = [
            (
                "https://docs.test/docs",
                r##"<h1>Home</h1><a href="/docs/a">A</a><a href="/docs/b">B</a>
                   <a href="/blog/x">blog</a><a href="/docs/a#part">A again</a>"##,
            ),
            (
                "https://docs.test/docs/a",
                r#"<h1>A</h1><a href="/docs">home</a><a href="b">B</a><a href="/docs/c">C</a>"#,
            ),
            ("https://docs.test/docs/b", "<h1>B</h1><p>leaf</p>"),
        ]
        .into_iter()
        .map(|(u, h)| (u.to_string(), h.to_string()))
        .collect();
        Fetcher::Fixture {
            pages,
            redirects: HashMap::new(),
        }
    }

    fn owned(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn redirecting_site() -> Fetcher {
        Fetcher::Fixture {
            pages: owned(&[
                (
                    "https://docs.test/docs/app/",
                    r#"<h1>App</h1><a href="routing">Routing</a><a href="/docs/old">old</a>
                       <a href="/docs/app/">self</a>"#,
                ),
                ("https://docs.test/docs/app/routing", "<h1>Routing</h1>"),
            ]),
            redirects: owned(&[
                ("https://docs.test/docs", "https://docs.test/docs/app/"),
                ("https://docs.test/docs/old", "https://docs.test/docs/app/"),
            ]),
        }
    }

    fn setup() -> (Connection, Settings) {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let mut settings = Profile::Nextjs.settings();
        settings.start_urls = vec!["https://docs.test/docs#top".into()];
        settings.concurrency = 2;
        (conn, settings)
    }

    #[tokio::test]
    async fn follows_each_doc_link_once() {
        let (conn, settings) = setup();
        assert_eq!(seed(&conn, &settings).await.unwrap(), 1);

        let stats = crawl(&conn, &settings, site(), None).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.errors, 1); // /docs/c is a 404
        assert_eq!(stats.discovered, 3);

        let mut urls = db::all_urls(&conn).unwrap();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://docs.test/docs",
                "https://docs.test/docs/a",
                "https://docs.test/docs/b",
                "https://docs.test/docs/c",
            ]
        );

        let s = db::get_stats(&conn).unwrap();
        assert_eq!((s.visited, s.unvisited, s.fetched), (4, 0, 4));
    }

    #[tokio::test]
    async fn limit_leaves_rest_queued() {
        let (conn, settings) = setup();
        seed(&conn, &settings).await.unwrap();

        let stats = crawl(&conn, &settings, site(), Some(1)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.discovered, 2);
        assert_eq!(db::fetch_unvisited(&conn, None).unwrap().len(), 2);

        // resuming picks up the queue and does not refetch the seed
        let stats = crawl(&conn, &settings, site(), None).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(db::get_stats(&conn).unwrap().fetched, 4);
    }

    #[tokio::test]
    async fn links_resolve_against_redirect_target() {
        let (conn, settings) = setup();
        seed(&conn, &settings).await.unwrap();

        let stats = crawl(&conn, &settings, redirecting_site(), None).await.unwrap();
        assert_eq!((stats.total, stats.ok, stats.errors), (3, 3, 0));
        assert_eq!(stats.discovered, 2);

        let mut urls = db::all_urls(&conn).unwrap();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://docs.test/docs",
                "https://docs.test/docs/app/routing",
                "https://docs.test/docs/old",
            ]
        );

        // the redirect target is stored once, under the served URL
        let pages: Vec<String> = db::fetch_unprocessed(&conn, None)
            .unwrap()
            .into_iter()
            .map(|p| p.url)
            .collect();
        assert_eq!(
            pages,
            vec!["https://docs.test/docs/app/", "https://docs.test/docs/app/routing"]
        );
    }

    #[test]
    fn served_url_drops_fragment_and_falls_back() {
        assert_eq!(
            served_url("https://docs.test/docs", Some("https://docs.test/docs/app/#top")),
            "https://docs.test/docs/app/"
        );
        assert_eq!(served_url("https://docs.test/docs", None), "https://docs.test/docs");
        assert_eq!(served_url("https://docs.test/docs", Some("::")), "https://docs.test/docs");
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let (conn, settings) = setup();
        let stats = crawl(&conn, &settings, site(), None).await.unwrap();
        assert_eq!(stats.total, 0);
    }
}
