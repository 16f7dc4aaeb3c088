use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pages (
            id         INTEGER PRIMARY KEY,
            url        TEXT UNIQUE NOT NULL,
            depth      INTEGER NOT NULL DEFAULT 0,
            visited    BOOLEAN NOT NULL DEFAULT 0,
            visited_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_pages_visited ON pages(visited);

        CREATE TABLE IF NOT EXISTS page_data (
            id         INTEGER PRIMARY KEY,
            page_id    INTEGER NOT NULL REFERENCES pages(id),
            url        TEXT NOT NULL,
            html       TEXT,
            status     INTEGER,
            error      TEXT,
            latency_ms INTEGER,
            links_found INTEGER NOT NULL DEFAULT 0,
            fetched_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_page_data_url ON page_data(url);

        CREATE TABLE IF NOT EXISTS page_records (
            id           INTEGER PRIMARY KEY,
            page_data_id INTEGER NOT NULL UNIQUE REFERENCES page_data(id),
            url          TEXT UNIQUE NOT NULL,
            title        TEXT,
            last_updated TEXT,
            sections     INTEGER NOT NULL,
            record       TEXT NOT NULL,
            processed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Queue ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPage {
    pub page_id: i64,
    pub url: String,
    pub depth: u32,
}

/// Insert seed URLs, ignoring ones already queued. Returns the number added.
pub fn insert_pages(conn: &Connection, urls: &[String], depth: u32) -> Result<usize> {
    Ok(insert_discovered(conn, urls, depth)?.len())
}

/// Insert URLs, returning only the rows that were new.
pub fn insert_discovered<S: AsRef<str>>(
    conn: &Connection,
    urls: &[S],
    depth: u32,
) -> Result<Vec<QueuedPage>> {
    let tx = conn.unchecked_transaction()?;
    let mut added = Vec::new();
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO pages (url, depth) VALUES (?1, ?2)")?;
        for url in urls {
            let url = url.as_ref();
            if stmt.execute(rusqlite::params![url, depth])? == 1 {
                added.push(QueuedPage {
                    page_id: tx.last_insert_rowid(),
                    url: url.to_string(),
                    depth,
                });
            }
        }
    }
    tx.commit()?;
    Ok(added)
}

/// Every URL the crawl has ever scheduled, visited or not.
pub fn all_urls(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT url FROM pages")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_unvisited(conn: &Connection, limit: Option<usize>) -> Result<Vec<QueuedPage>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT id, url, depth FROM pages WHERE visited = 0 ORDER BY id LIMIT {}",
            n
        ),
        None => "SELECT id, url, depth FROM pages WHERE visited = 0 ORDER BY id".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(QueuedPage {
                page_id: row.get(0)?,
                url: row.get(1)?,
                depth: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct FetchRow {
    pub page_id: i64,
    pub url: String,
    pub depth: u32,
    pub html: Option<String>,
    pub status: Option<i32>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub discovered: Vec<String>,
}

/// Save a fetch result and mark its page visited using prepared statements.
pub fn save_fetch(
    insert: &mut rusqlite::Statement,
    update: &mut rusqlite::Statement,
    row: &FetchRow,
) -> Result<()> {
    insert.execute(rusqlite::params![
        row.page_id,
        row.url,
        row.html,
        row.status,
        row.error,
        row.latency_ms,
        row.discovered.len(),
    ])?;
    update.execute(rusqlite::params![row.page_id])?;
    Ok(())
}

pub const INSERT_PAGE_DATA: &str =
    "INSERT INTO page_data (page_id, url, html, status, error, latency_ms, links_found)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";
pub const MARK_VISITED: &str =
    "UPDATE pages SET visited = 1, visited_at = datetime('now') WHERE id = ?1";

// ── Processing ──

pub struct FetchedPage {
    pub page_data_id: i64,
    pub url: String,
    pub html: String,
}

pub fn fetch_unprocessed(conn: &Connection, limit: Option<usize>) -> Result<Vec<FetchedPage>> {
    let sql = format!(
        "SELECT pd.id, pd.url, pd.html
         FROM page_data pd
         LEFT JOIN page_records r ON r.page_data_id = pd.id
         WHERE pd.html IS NOT NULL AND pd.error IS NULL AND r.id IS NULL
         ORDER BY pd.id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(FetchedPage {
                page_data_id: row.get(0)?,
                url: row.get(1)?,
                html: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct RecordRow {
    pub page_data_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub last_updated: Option<String>,
    pub sections: usize,
    pub record: String,
}

pub fn save_records(conn: &Connection, rows: &[RecordRow]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO page_records
             (page_data_id, url, title, last_updated, sections, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for r in rows {
            stmt.execute(rusqlite::params![
                r.page_data_id, r.url, r.title, r.last_updated, r.sections, r.record,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Stored record JSON, in processing order.
pub fn fetch_records(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT record FROM page_records ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_record(conn: &Connection, url: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT record FROM page_records WHERE url = ?1")?;
    let mut rows = stmt.query_map([url], |row| row.get(0))?;
    let record = rows.next().transpose()?;
    Ok(record)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub visited: usize,
    pub unvisited: usize,
    pub fetched: usize,
    pub errors: usize,
    pub processed: usize,
    pub sections: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let total: usize = conn.query_row("SELECT COUNT(*) FROM pages", [], |r| r.get(0))?;
    let visited: usize =
        conn.query_row("SELECT COUNT(*) FROM pages WHERE visited = 1", [], |r| r.get(0))?;
    let fetched: usize = conn.query_row("SELECT COUNT(*) FROM page_data", [], |r| r.get(0))?;
    let errors: usize = conn.query_row(
        "SELECT COUNT(*) FROM page_data WHERE error IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let processed: usize =
        conn.query_row("SELECT COUNT(*) FROM page_records", [], |r| r.get(0))?;
    let sections: usize = conn.query_row(
        "SELECT COALESCE(SUM(sections), 0) FROM page_records",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        total,
        visited,
        unvisited: total - visited,
        fetched,
        errors,
        processed,
        sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn fetched(conn: &Connection, page: &QueuedPage, html: Option<&str>, error: Option<&str>) {
        let mut insert = conn.prepare(INSERT_PAGE_DATA).unwrap();
        let mut update = conn.prepare(MARK_VISITED).unwrap();
        save_fetch(
            &mut insert,
            &mut update,
            &FetchRow {
                page_id: page.page_id,
                url: page.url.clone(),
                depth: page.depth,
                html: html.map(str::to_string),
                status: Some(200),
                error: error.map(str::to_string),
                latency_ms: Some(5),
                discovered: Vec::new(),
            },
        )
        .unwrap();
    }

    #[test]
    fn insert_ignores_duplicates() {
        let conn = memory();
        let urls = vec!["https://a.test/docs".to_string(), "https://a.test/docs/b".to_string()];
        assert_eq!(insert_pages(&conn, &urls, 0).unwrap(), 2);
        assert_eq!(insert_pages(&conn, &urls, 0).unwrap(), 0);

        let added = insert_discovered(&conn, &["https://a.test/docs/b", "https://a.test/docs/c"], 1).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].url, "https://a.test/docs/c");
        assert_eq!(added[0].depth, 1);
        assert_eq!(all_urls(&conn).unwrap().len(), 3);
    }

    #[test]
    fn fetch_marks_visited() {
        let conn = memory();
        insert_pages(&conn, &["https://a.test/docs".to_string()], 0).unwrap();
        let queued = fetch_unvisited(&conn, None).unwrap();
        assert_eq!(queued.len(), 1);

        fetched(&conn, &queued[0], Some("<h1>x</h1>"), None);
        assert!(fetch_unvisited(&conn, None).unwrap().is_empty());

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.total, s.visited, s.unvisited, s.fetched, s.errors), (1, 1, 0, 1, 0));
    }

    #[test]
    fn unprocessed_skips_errors_and_done() {
        let conn = memory();
        let urls: Vec<String> = (0..3).map(|i| format!("https://a.test/docs/{i}")).collect();
        insert_pages(&conn, &urls, 0).unwrap();
        let queued = fetch_unvisited(&conn, None).unwrap();
        fetched(&conn, &queued[0], Some("<p>a</p>"), None);
        fetched(&conn, &queued[1], None, Some("HTTP 404"));
        fetched(&conn, &queued[2], Some("<p>c</p>"), None);

        let pending = fetch_unprocessed(&conn, None).unwrap();
        assert_eq!(pending.len(), 2);

        save_records(
            &conn,
            &[RecordRow {
                page_data_id: pending[0].page_data_id,
                url: pending[0].url.clone(),
                title: None,
                last_updated: None,
                sections: 1,
                record: "{}".into(),
            }],
        )
        .unwrap();

        let pending = fetch_unprocessed(&conn, None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, "https://a.test/docs/2");
        assert_eq!(get_stats(&conn).unwrap().errors, 1);
    }

    #[test]
    fn record_lookup() {
        let conn = memory();
        insert_pages(&conn, &["https://a.test/docs".to_string()], 0).unwrap();
        let queued = fetch_unvisited(&conn, None).unwrap();
        fetched(&conn, &queued[0], Some("<p>a</p>"), None);
        let page = &fetch_unprocessed(&conn, None).unwrap()[0];
        save_records(
            &conn,
            &[RecordRow {
                page_data_id: page.page_data_id,
                url: page.url.clone(),
                title: Some("Docs".into()),
                last_updated: None,
                sections: 4,
                record: r#"{"url":"https://a.test/docs","structure":[]}"#.into(),
            }],
        )
        .unwrap();

        assert!(fetch_record(&conn, "https://a.test/docs").unwrap().is_some());
        assert!(fetch_record(&conn, "https://a.test/other").unwrap().is_none());
        assert_eq!(fetch_records(&conn).unwrap().len(), 1);
        assert_eq!(get_stats(&conn).unwrap().sections, 4);
    }
}
