use anyhow::{Context, Result};
use tracing::info;
use url::Url;

/// Fetch a sitemap and return the page URLs on one of `hosts` whose path
/// starts with `path_prefix`.
pub async fn fetch_doc_urls(
    client: &reqwest::Client,
    sitemap_url: &str,
    hosts: &[String],
    path_prefix: &str,
) -> Result<Vec<String>> {
    info!("Fetching sitemap: {}", sitemap_url);
    let xml = client
        .get(sitemap_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .with_context(|| format!("Failed to fetch sitemap {}", sitemap_url))?;

    let all_urls = parse_urlset(&xml)?;
    info!("Total URLs in sitemap: {}", all_urls.len());

    let filtered = filter_docs(all_urls, hosts, path_prefix);
    info!("Documentation pages after filtering: {}", filtered.len());
    Ok(filtered)
}

fn filter_docs(urls: Vec<String>, hosts: &[String], path_prefix: &str) -> Vec<String> {
    urls.into_iter()
        .filter_map(|raw| {
            let mut url = Url::parse(raw.trim()).ok()?;
            let on_site = url
                .host_str()
                .is_some_and(|host| hosts.iter().any(|h| h == host));
            if !matches!(url.scheme(), "http" | "https")
                || !on_site
                || !url.path().starts_with(path_prefix)
            {
                return None;
            }
            url.set_fragment(None);
            Some(String::from(url))
        })
        .collect()
}

/// Parse a urlset XML and return all <loc> URLs.
fn parse_urlset(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                urls.push(e.unescape()?.to_string());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITEMAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://nextjs.org/docs</loc><lastmod>2024-05-01</lastmod></url>
  <url><loc>https://nextjs.org/docs/app/routing#intro</loc></url>
  <url><loc>https://nextjs.org/blog/next-15</loc></url>
  <url><loc>https://nextjs.org/docs?a=1&amp;b=2</loc></url>
  <url><loc>https://mirror.example.com/docs/app</loc></url>
  <url><loc>ftp://nextjs.org/docs/archive</loc></url>
</urlset>"#;

    #[test]
    fn parses_locs() {
        let urls = parse_urlset(SITEMAP).unwrap();
        assert_eq!(urls.len(), 6);
        assert_eq!(urls[3], "https://nextjs.org/docs?a=1&b=2");
    }

    #[test]
    fn keeps_doc_prefix_only() {
        let hosts = vec!["nextjs.org".to_string()];
        let urls = filter_docs(parse_urlset(SITEMAP).unwrap(), &hosts, "/docs");
        assert_eq!(
            urls,
            vec![
                "https://nextjs.org/docs",
                "https://nextjs.org/docs/app/routing",
                "https://nextjs.org/docs?a=1&b=2",
            ]
        );
    }

    #[test]
    fn other_hosts_dropped() {
        let hosts = vec!["mirror.example.com".to_string()];
        let urls = filter_docs(parse_urlset(SITEMAP).unwrap(), &hosts, "/docs");
        assert_eq!(urls, vec!["https://mirror.example.com/docs/app"]);
        assert!(filter_docs(parse_urlset(SITEMAP).unwrap(), &[], "/docs").is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_urlset("<urlset><url><loc>x</url></urlset>").is_err());
    }
}
