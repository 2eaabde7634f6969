//! Durable record store backed by a single-table SQLite file.
//!
//! All SQLite work runs on blocking tasks; the async surface hands owned
//! data across `spawn_blocking`. Search is a LIKE scan over the keyword
//! blob and the addressing columns, ordered by ascending row id.

use crate::capture::keywords;
use crate::capture::{Headers, Record, RecordMeta};
use crate::errors::{Error, Result};
use bytes::Bytes;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

const TABLE_NAME: &str = "capture";
const DEFAULT_DATABASE_PATTERN: &str = "hyperfox-%05d.db";

const TABLE_CREATE_SQL: &str = r#"CREATE TABLE "capture" (
  "id" INTEGER PRIMARY KEY,
  "uuid" TEXT NOT NULL UNIQUE,
  "origin" VARCHAR(255),
  "method" VARCHAR(10),
  "status" INTEGER,
  "content_type" VARCHAR(255),
  "content_length" INTEGER,
  "host" VARCHAR(255),
  "url" TEXT,
  "path" TEXT,
  "scheme" VARCHAR(10),
  "header" TEXT,
  "body" BLOB,
  "request_header" TEXT,
  "request_body" BLOB,
  "keywords" BLOB,
  "date_start" DATETIME,
  "date_end" DATETIME,
  "time_taken" INTEGER
)"#;

const META_COLUMNS: &str =
  "id, uuid, origin, method, status, content_type, content_length, host, url, path, scheme, date_start, date_end, time_taken";

/// A page of search results.
#[derive(Debug)]
pub struct SearchPage {
  /// Metadata of the matching records, ascending by id.
  pub records: Vec<RecordMeta>,
  /// Total number of pages for this query.
  pub pages: u64,
  /// The page these records belong to.
  pub page: u64,
}

/// Handle to the capture database.
#[derive(Clone)]
pub struct RecordStore {
  path: Arc<PathBuf>,
}

impl RecordStore {
  /// Open (and initialize when missing) the capture table at `path`.
  pub async fn open(path: PathBuf) -> Result<Self> {
    let store = RecordStore {
      path: Arc::new(path),
    };
    let path = store.path.clone();
    spawn_db(move || {
      let conn = open_connection(&path)?;
      init_schema(&conn)
    })
    .await?;
    Ok(store)
  }

  /// Path of the underlying database file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Insert a record and return its assigned row id.
  pub async fn insert(&self, record: Record) -> Result<u64> {
    let path = self.path.clone();
    spawn_db(move || {
      let conn = open_connection(&path)?;
      insert_record(&conn, &record)
    })
    .await
  }

  /// Fetch a full record, bodies included, by its UUID.
  pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Record>> {
    let path = self.path.clone();
    spawn_db(move || {
      let conn = open_connection(&path)?;
      find_by_uuid(&conn, uuid)
    })
    .await
  }

  /// Metadata-only search. An empty query returns everything, paginated.
  pub async fn search(&self, query: &str, page: u64, page_size: u64) -> Result<SearchPage> {
    let query = query.to_string();
    let path = self.path.clone();
    spawn_db(move || {
      let conn = open_connection(&path)?;
      search(&conn, &query, page, page_size)
    })
    .await
  }
}

async fn spawn_db<T, F>(f: F) -> Result<T>
where
  T: Send + 'static,
  F: FnOnce() -> Result<T> + Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| Error::Proxy(format!("store task failed: {e}")))?
}

fn open_connection(path: &Path) -> Result<Connection> {
  let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
    | OpenFlags::SQLITE_OPEN_CREATE
    | OpenFlags::SQLITE_OPEN_NO_MUTEX;
  let conn = Connection::open_with_flags(path, flags)?;
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "synchronous", "NORMAL")?;
  conn.busy_timeout(std::time::Duration::from_secs(5))?;
  Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
  let exists: bool = conn
    .query_row(
      "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
      [TABLE_NAME],
      |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)?;
  if !exists {
    tracing::info!("initializing capture table");
    conn.execute(TABLE_CREATE_SQL, [])?;
  }
  Ok(())
}

fn format_datetime(value: OffsetDateTime) -> String {
  value
    .format(&Rfc3339)
    .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn parse_datetime(value: &str) -> Result<OffsetDateTime> {
  OffsetDateTime::parse(value, &Rfc3339)
    .map_err(|e| Error::Proxy(format!("invalid stored timestamp {value}: {e}")))
}

fn insert_record(conn: &Connection, record: &Record) -> Result<u64> {
  let meta = &record.meta;
  let header = serde_json::to_string(&meta.header)
    .map_err(|e| Error::Proxy(format!("serialize response headers: {e}")))?;
  let request_header = serde_json::to_string(&meta.request_header)
    .map_err(|e| Error::Proxy(format!("serialize request headers: {e}")))?;

  conn.execute(
    r#"INSERT INTO "capture" (
      uuid, origin, method, status, content_type, content_length,
      host, url, path, scheme, header, body, request_header, request_body,
      keywords, date_start, date_end, time_taken
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"#,
    rusqlite::params![
      meta.uuid.to_string(),
      meta.origin,
      meta.method,
      meta.status,
      meta.content_type,
      meta.content_length,
      meta.host,
      meta.url,
      meta.path,
      meta.scheme,
      header,
      record.body.as_ref(),
      request_header,
      record.request_body.as_ref(),
      record.keywords,
      format_datetime(meta.date_start),
      format_datetime(meta.date_end),
      meta.time_taken,
    ],
  )?;
  Ok(conn.last_insert_rowid() as u64)
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> Result<RecordMeta> {
  let uuid: String = row.get("uuid")?;
  let date_start: String = row.get("date_start")?;
  let date_end: String = row.get("date_end")?;
  Ok(RecordMeta {
    id: row.get::<_, i64>("id")? as u64,
    uuid: Uuid::parse_str(&uuid).map_err(|e| Error::Proxy(format!("invalid stored uuid: {e}")))?,
    origin: row.get("origin")?,
    method: row.get("method")?,
    status: row.get::<_, i64>("status")? as u16,
    content_type: row.get("content_type")?,
    content_length: row.get::<_, i64>("content_length")? as u64,
    host: row.get("host")?,
    url: row.get("url")?,
    path: row.get("path")?,
    scheme: row.get("scheme")?,
    date_start: parse_datetime(&date_start)?,
    date_end: parse_datetime(&date_end)?,
    time_taken: row.get("time_taken")?,
    header: Headers::default(),
    request_header: Headers::default(),
  })
}

fn find_by_uuid(conn: &Connection, uuid: Uuid) -> Result<Option<Record>> {
  // Body columns travel as hex text so blob content can never be confused
  // with NULL on the way out.
  let sql = format!(
    "SELECT {META_COLUMNS}, header, request_header, hex(body) AS body, hex(request_body) AS request_body FROM \"capture\" WHERE uuid = ?1"
  );
  let mut stmt = conn.prepare(&sql)?;
  let mut rows = stmt.query([uuid.to_string()])?;
  let Some(row) = rows.next()? else {
    return Ok(None);
  };

  let mut meta = meta_from_row(row)?;
  let header: String = row.get("header")?;
  let request_header: String = row.get("request_header")?;
  meta.header = serde_json::from_str(&header)
    .map_err(|e| Error::Proxy(format!("deserialize response headers: {e}")))?;
  meta.request_header = serde_json::from_str(&request_header)
    .map_err(|e| Error::Proxy(format!("deserialize request headers: {e}")))?;

  let body: String = row.get("body")?;
  let request_body: String = row.get("request_body")?;
  let body =
    hex::decode(body).map_err(|e| Error::Proxy(format!("invalid stored body hex: {e}")))?;
  let request_body = hex::decode(request_body)
    .map_err(|e| Error::Proxy(format!("invalid stored request body hex: {e}")))?;

  Ok(Some(Record {
    meta,
    keywords: Vec::new(),
    request_body: Bytes::from(request_body),
    body: Bytes::from(body),
  }))
}

/// Build the WHERE clause for a sanitized query string. Each term is ANDed;
/// within a term the addressing columns are ORed.
fn search_filter(query: &str) -> (String, Vec<SqlValue>) {
  let sanitized = keywords::sanitize(query);
  let terms: Vec<&str> = sanitized.split_whitespace().collect();
  if terms.is_empty() {
    return (String::new(), Vec::new());
  }

  let mut clauses = Vec::with_capacity(terms.len());
  let mut values: Vec<SqlValue> = Vec::new();
  for term in terms {
    let like = format!("%{term}%");
    clauses.push(
      "(keywords LIKE ? OR host LIKE ? OR origin LIKE ? OR path LIKE ? \
       OR content_type LIKE ? OR method = ? OR scheme = ? OR status = ?)"
        .to_string(),
    );
    for _ in 0..5 {
      values.push(SqlValue::Text(like.clone()));
    }
    for _ in 0..3 {
      values.push(SqlValue::Text(term.to_string()));
    }
  }
  (format!(" WHERE {}", clauses.join(" AND ")), values)
}

fn search(conn: &Connection, query: &str, page: u64, page_size: u64) -> Result<SearchPage> {
  let page = page.max(1);
  let page_size = if page_size == 0 { 10 } else { page_size };

  let (filter, values) = search_filter(query);

  let count_sql = format!("SELECT COUNT(*) FROM \"capture\"{filter}");
  let total: u64 = conn.query_row(&count_sql, params_from_iter(values.iter()), |row| {
    row.get::<_, i64>(0)
  })? as u64;
  let pages = total.div_ceil(page_size);

  let select_sql = format!(
    "SELECT {META_COLUMNS} FROM \"capture\"{filter} ORDER BY id ASC LIMIT ? OFFSET ?"
  );
  let mut all_values = values;
  all_values.push(SqlValue::Integer(page_size as i64));
  all_values.push(SqlValue::Integer((page_size * (page - 1)) as i64));

  let mut stmt = conn.prepare(&select_sql)?;
  let mut rows = stmt.query(params_from_iter(all_values.iter()))?;
  let mut records = Vec::new();
  while let Some(row) = rows.next()? {
    records.push(meta_from_row(row)?);
  }

  Ok(SearchPage {
    records,
    pages,
    page,
  })
}

/// Pick the database file: an explicit path wins, otherwise the first
/// unused `hyperfox-00000.db` style slot in the working directory.
pub fn pick_database_path(explicit: Option<PathBuf>) -> PathBuf {
  if let Some(path) = explicit {
    return path;
  }
  for i in 0u32.. {
    let name = DEFAULT_DATABASE_PATTERN.replace("%05d", &format!("{i:05}"));
    let candidate = PathBuf::from(name);
    if !candidate.exists() {
      return candidate;
    }
  }
  unreachable!("u32 database slots exhausted")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capture::Headers;
  use http::HeaderMap;

  fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("hyperfox-store-test-{name}.db"));
    let _ = std::fs::remove_file(&path);
    path
  }

  fn sample_record(host: &str, path: &str, status: u16, body: &[u8]) -> Record {
    let now = OffsetDateTime::now_utc();
    let mut header = HeaderMap::new();
    header.insert("content-type", "text/plain".parse().unwrap());
    Record {
      meta: RecordMeta {
        id: 0,
        uuid: Uuid::new_v4(),
        origin: "127.0.0.1:5999".into(),
        method: "GET".into(),
        status,
        content_type: "text/plain; charset=utf-8".into(),
        content_length: body.len() as u64,
        host: host.into(),
        url: format!("http://{host}{path}"),
        path: path.into(),
        scheme: "http".into(),
        date_start: now,
        date_end: now,
        time_taken: 0,
        header: Headers(header),
        request_header: Headers::default(),
      },
      keywords: keywords::extract(&[body]),
      request_body: Bytes::new(),
      body: Bytes::copy_from_slice(body),
    }
  }

  #[tokio::test]
  async fn insert_assigns_monotonic_ids() {
    let store = RecordStore::open(temp_db("ids")).await.unwrap();
    let first = store
      .insert(sample_record("a.test", "/", 200, b"one"))
      .await
      .unwrap();
    let second = store
      .insert(sample_record("a.test", "/", 200, b"two"))
      .await
      .unwrap();
    assert!(second > first);
  }

  #[tokio::test]
  async fn find_by_uuid_round_trips_bodies_and_headers() {
    let store = RecordStore::open(temp_db("uuid")).await.unwrap();
    let record = sample_record("b.test", "/file", 200, b"payload bytes");
    let uuid = record.meta.uuid;
    store.insert(record).await.unwrap();

    let found = store.find_by_uuid(uuid).await.unwrap().unwrap();
    assert_eq!(found.body.as_ref(), b"payload bytes");
    assert_eq!(found.meta.host, "b.test");
    assert_eq!(found.meta.header.0.get("content-type").unwrap(), "text/plain");

    let missing = store.find_by_uuid(Uuid::new_v4()).await.unwrap();
    assert!(missing.is_none());
  }

  #[tokio::test]
  async fn duplicate_uuid_is_rejected() {
    let store = RecordStore::open(temp_db("dup")).await.unwrap();
    let record = sample_record("c.test", "/", 200, b"x");
    let mut clone = record.clone();
    clone.meta.id = 0;
    store.insert(record).await.unwrap();
    assert!(store.insert(clone).await.is_err());
  }

  #[tokio::test]
  async fn search_matches_host_keywords_and_exact_status() {
    let store = RecordStore::open(temp_db("search")).await.unwrap();
    store
      .insert(sample_record("example.test", "/", 200, b"hello capture"))
      .await
      .unwrap();
    store
      .insert(sample_record("other.test", "/data", 404, b"missing"))
      .await
      .unwrap();

    // Substring on host.
    let page = store.search("example", 1, 10).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].host, "example.test");

    // Keyword blob.
    let page = store.search("capture", 1, 10).await.unwrap();
    assert_eq!(page.records.len(), 1);

    // Exact status, ANDed with the host term.
    let page = store.search("example 200", 1, 10).await.unwrap();
    assert_eq!(page.records.len(), 1);
    let page = store.search("example 404", 1, 10).await.unwrap();
    assert_eq!(page.records.len(), 0);

    // Empty query returns everything.
    let page = store.search("", 1, 10).await.unwrap();
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.pages, 1);
  }

  #[tokio::test]
  async fn pagination_is_contiguous_and_ordered() {
    let store = RecordStore::open(temp_db("pages")).await.unwrap();
    for i in 0..7 {
      store
        .insert(sample_record("p.test", &format!("/{i}"), 200, b"row"))
        .await
        .unwrap();
    }

    let mut seen = Vec::new();
    for page_no in 1..=3 {
      let page = store.search("", page_no, 3).await.unwrap();
      assert_eq!(page.pages, 3);
      assert_eq!(page.page, page_no);
      seen.extend(page.records.iter().map(|r| r.id));
    }
    assert_eq!(seen.len(), 7);
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "pages must be ordered by ascending id");
  }

  #[test]
  fn database_path_probing_skips_existing_slots() {
    let dir = std::env::temp_dir().join("hyperfox-dbprobe-test");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(&dir).unwrap();

    let first = pick_database_path(None);
    assert_eq!(first, PathBuf::from("hyperfox-00000.db"));
    std::fs::write(&first, b"").unwrap();
    let second = pick_database_path(None);
    assert_eq!(second, PathBuf::from("hyperfox-00001.db"));

    std::env::set_current_dir(cwd).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
  }
}
