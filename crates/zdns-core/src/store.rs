//! The persistent store (C1): one SQLite file holding `events`, `devices`,
//! `rules`, `list_sources`, `stix_collections`, `stix_objects`.
//!
//! `open_store` is the explicit, side-effect-free-at-import replacement for
//! the teacher's module-level `CREATE TABLE IF NOT EXISTS` habit: importing
//! this module does nothing; calling `open_store(path)` runs idempotent DDL
//! and hands back a pool. Migrations are additive columns, applied by
//! introspecting `PRAGMA table_info` first — SQLite has no
//! `ADD COLUMN IF NOT EXISTS`, unlike the Postgres dialect the teacher used.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{ZdnsError, ZdnsResult};

pub const DEFAULT_COLLECTION_ID: &str = "zdns-threat-intel";

/// All writes are serialized through a single connection, matching spec's
/// "write-ahead + single connection or serialized access" invariant.
pub async fn open_store(path: &str) -> ZdnsResult<SqlitePool> {
    let url = format!("sqlite://{}?mode=rwc", path);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await?;

    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

    open_store_for_pool(&pool).await?;

    log::info!("[store] opened {} and verified schema", path);
    Ok(pool)
}

/// Runs the same idempotent DDL + migrations against an already-open pool.
/// Split out so in-memory test pools can share the exact schema path that
/// `open_store` uses against the real file.
pub async fn open_store_for_pool(pool: &SqlitePool) -> ZdnsResult<()> {
    create_tables(pool).await?;
    run_migrations(pool).await?;
    ensure_default_collection(pool).await?;
    ensure_metrics_row(pool).await?;
    Ok(())
}

async fn create_tables(pool: &SqlitePool) -> ZdnsResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ray_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            score REAL NOT NULL,
            action TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            source TEXT NOT NULL,
            client_ip TEXT,
            rule_id INTEGER,
            rule_action TEXT,
            label TEXT,
            qtype TEXT,
            raw_json TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_domain_ts ON events (domain, timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS devices (
            client_ip TEXT PRIMARY KEY,
            hostname TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            query_count INTEGER NOT NULL DEFAULT 0,
            blocked_count INTEGER NOT NULL DEFAULT 0,
            warn_count INTEGER NOT NULL DEFAULT 0,
            allow_count INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            pattern TEXT NOT NULL,
            match_type TEXT NOT NULL,
            action TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 100,
            notes TEXT,
            source TEXT NOT NULL DEFAULT 'admin',
            expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(pattern, match_type)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_priority ON rules (priority, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS list_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            list_type TEXT NOT NULL,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_fetched TEXT,
            last_imported INTEGER,
            last_error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stix_collections (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            can_read INTEGER NOT NULL DEFAULT 1,
            can_write INTEGER NOT NULL DEFAULT 1,
            created TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stix_objects (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            type TEXT NOT NULL,
            spec_version TEXT,
            created TEXT,
            modified TEXT,
            added_at TEXT NOT NULL,
            data TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stix_objects_collection ON stix_objects (collection_id, added_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_queries INTEGER NOT NULL DEFAULT 0,
            blocked INTEGER NOT NULL DEFAULT 0,
            warnings INTEGER NOT NULL DEFAULT 0,
            allowed INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Columns added after the initial schema. Listed explicitly so
/// `run_migrations` can check each one against `PRAGMA table_info` instead of
/// relying on SQLite syntax it doesn't have.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("devices", "hostname", "TEXT"),
    ("rules", "notes", "TEXT"),
];

async fn run_migrations(pool: &SqlitePool) -> ZdnsResult<()> {
    for (table, column, coltype) in ADDITIVE_COLUMNS {
        if !column_exists(pool, table, column).await? {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, coltype);
            sqlx::query(&sql).execute(pool).await?;
            log::info!("[store] migrated {}: added column {}", table, column);
        }
    }
    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> ZdnsResult<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().any(|r| {
        let name: String = r.get("name");
        name == column
    }))
}

async fn ensure_default_collection(pool: &SqlitePool) -> ZdnsResult<()> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM stix_collections WHERE id = ?")
        .bind(DEFAULT_COLLECTION_ID)
        .fetch_optional(pool)
        .await?;
    if existing.is_none() {
        sqlx::query(
            "INSERT INTO stix_collections (id, title, description, can_read, can_write, created) VALUES (?, ?, ?, 1, 1, ?)",
        )
        .bind(DEFAULT_COLLECTION_ID)
        .bind("ZDNS Threat Intel")
        .bind("Default collection materialized on first access")
        .bind(now_iso())
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn ensure_metrics_row(pool: &SqlitePool) -> ZdnsResult<()> {
    sqlx::query("INSERT OR IGNORE INTO metrics (id, total_queries, blocked, warnings, allowed) VALUES (1, 0, 0, 0, 0)")
        .execute(pool)
        .await?;
    Ok(())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchType {
    Exact,
    Suffix,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "EXACT",
            MatchType::Suffix => "SUFFIX",
            MatchType::Regex => "REGEX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EXACT" => Some(MatchType::Exact),
            "SUFFIX" => Some(MatchType::Suffix),
            "REGEX" => Some(MatchType::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Warn,
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Warn => "WARN",
            Action::Block => "BLOCK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ALLOW" => Some(Action::Allow),
            "WARN" => Some(Action::Warn),
            "BLOCK" => Some(Action::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: i64,
    pub name: Option<String>,
    pub pattern: String,
    pub match_type: String,
    pub action: String,
    pub enabled: bool,
    pub priority: i64,
    pub notes: Option<String>,
    pub source: String,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Rule {
    fn from_row(row: &SqliteRow) -> Self {
        Rule {
            id: row.get("id"),
            name: row.get("name"),
            pattern: row.get("pattern"),
            match_type: row.get("match_type"),
            action: row.get("action"),
            enabled: row.get::<i64, _>("enabled") != 0,
            priority: row.get("priority"),
            notes: row.get("notes"),
            source: row.get("source"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Enabled rules in `(priority ASC, id ASC)` order — the order
/// `evaluate_domain` must scan in for first-match-wins precedence.
pub async fn list_enabled_rules_ordered(pool: &SqlitePool) -> ZdnsResult<Vec<Rule>> {
    let rows = sqlx::query("SELECT * FROM rules WHERE enabled = 1 ORDER BY priority ASC, id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(Rule::from_row).collect())
}

pub async fn list_rules(pool: &SqlitePool) -> ZdnsResult<Vec<Rule>> {
    let rows = sqlx::query("SELECT * FROM rules ORDER BY priority ASC, id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(Rule::from_row).collect())
}

pub async fn get_rule(pool: &SqlitePool, id: i64) -> ZdnsResult<Option<Rule>> {
    let row = sqlx::query("SELECT * FROM rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Rule::from_row(&r)))
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: Option<String>,
    pub pattern: String,
    pub match_type: MatchType,
    pub action: Action,
    pub enabled: bool,
    pub priority: i64,
    pub notes: Option<String>,
    pub source: String,
    pub expires_at: Option<String>,
}

pub async fn create_rule(pool: &SqlitePool, r: &NewRule) -> ZdnsResult<i64> {
    let now = now_iso();
    let result = sqlx::query(
        "INSERT INTO rules (name, pattern, match_type, action, enabled, priority, notes, source, expires_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&r.name)
    .bind(&r.pattern)
    .bind(r.match_type.as_str())
    .bind(r.action.as_str())
    .bind(r.enabled as i64)
    .bind(r.priority)
    .bind(&r.notes)
    .bind(&r.source)
    .bind(&r.expires_at)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Upsert keyed on `(pattern, match_type)`, used by list ingestion and the
/// rule synchronizer. Preserves `id` (and thus tie-break order) on update.
pub async fn upsert_rule_by_pattern(pool: &SqlitePool, r: &NewRule) -> ZdnsResult<i64> {
    let now = now_iso();
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM rules WHERE pattern = ? AND match_type = ?",
    )
    .bind(&r.pattern)
    .bind(r.match_type.as_str())
    .fetch_optional(pool)
    .await?;

    if let Some((id,)) = existing {
        sqlx::query(
            "UPDATE rules SET name = ?, action = ?, enabled = ?, priority = ?, notes = ?, source = ?, expires_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&r.name)
        .bind(r.action.as_str())
        .bind(r.enabled as i64)
        .bind(r.priority)
        .bind(&r.notes)
        .bind(&r.source)
        .bind(&r.expires_at)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(id)
    } else {
        create_rule(pool, r).await
    }
}

pub async fn update_rule(pool: &SqlitePool, id: i64, r: &NewRule) -> ZdnsResult<bool> {
    let now = now_iso();
    let result = sqlx::query(
        "UPDATE rules SET name = ?, pattern = ?, match_type = ?, action = ?, enabled = ?, priority = ?, notes = ?, source = ?, expires_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&r.name)
    .bind(&r.pattern)
    .bind(r.match_type.as_str())
    .bind(r.action.as_str())
    .bind(r.enabled as i64)
    .bind(r.priority)
    .bind(&r.notes)
    .bind(&r.source)
    .bind(&r.expires_at)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_rule(pool: &SqlitePool, id: i64) -> ZdnsResult<bool> {
    let result = sqlx::query("DELETE FROM rules WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub ray_id: String,
    pub domain: String,
    pub score: f64,
    pub action: String,
    pub timestamp: String,
    pub source: String,
    pub client_ip: Option<String>,
    pub rule_id: Option<i64>,
    pub rule_action: Option<String>,
    pub label: Option<String>,
    pub qtype: Option<String>,
    pub raw_json: Option<String>,
}

impl Event {
    fn from_row(row: &SqliteRow) -> Self {
        Event {
            id: row.get("id"),
            ray_id: row.get("ray_id"),
            domain: row.get("domain"),
            score: row.get("score"),
            action: row.get("action"),
            timestamp: row.get("timestamp"),
            source: row.get("source"),
            client_ip: row.get("client_ip"),
            rule_id: row.get("rule_id"),
            rule_action: row.get("rule_action"),
            label: row.get("label"),
            qtype: row.get("qtype"),
            raw_json: row.get("raw_json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub ray_id: String,
    pub domain: String,
    pub score: f64,
    pub action: String,
    pub timestamp: String,
    pub source: String,
    pub client_ip: Option<String>,
    pub rule_id: Option<i64>,
    pub rule_action: Option<String>,
    pub label: Option<String>,
    pub qtype: Option<String>,
    pub raw_json: Option<String>,
}

pub async fn append_event(pool: &SqlitePool, e: &NewEvent) -> ZdnsResult<i64> {
    let result = sqlx::query(
        "INSERT INTO events (ray_id, domain, score, action, timestamp, source, client_ip, rule_id, rule_action, label, qtype, raw_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&e.ray_id)
    .bind(&e.domain)
    .bind(e.score)
    .bind(&e.action)
    .bind(&e.timestamp)
    .bind(&e.source)
    .bind(&e.client_ip)
    .bind(e.rule_id)
    .bind(&e.rule_action)
    .bind(&e.label)
    .bind(&e.qtype)
    .bind(&e.raw_json)
    .execute(pool)
    .await?;

    match e.action.as_str() {
        "BLOCK" => bump_metric(pool, "blocked").await?,
        "WARN" => bump_metric(pool, "warnings").await?,
        _ => bump_metric(pool, "allowed").await?,
    }
    bump_metric(pool, "total_queries").await?;

    Ok(result.last_insert_rowid())
}

async fn bump_metric(pool: &SqlitePool, column: &str) -> ZdnsResult<()> {
    let sql = format!("UPDATE metrics SET {} = {} + 1 WHERE id = 1", column, column);
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn list_events(pool: &SqlitePool, limit: i64) -> ZdnsResult<Vec<Event>> {
    let rows = sqlx::query("SELECT * FROM events ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(Event::from_row).collect())
}

pub async fn latest_event_for_domain(pool: &SqlitePool, domain: &str) -> ZdnsResult<Option<Event>> {
    let row = sqlx::query("SELECT * FROM events WHERE domain = ? ORDER BY id DESC LIMIT 1")
        .bind(domain)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Event::from_row(&r)))
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub total_queries: i64,
    pub blocked: i64,
    pub warnings: i64,
    pub allowed: i64,
    pub active_devices: i64,
}

pub async fn read_metrics(pool: &SqlitePool, active_window_min: i64) -> ZdnsResult<Metrics> {
    let row = sqlx::query("SELECT total_queries, blocked, warnings, allowed FROM metrics WHERE id = 1")
        .fetch_one(pool)
        .await?;
    let active_devices = active_device_count(pool, active_window_min).await?;
    Ok(Metrics {
        total_queries: row.get("total_queries"),
        blocked: row.get("blocked"),
        warnings: row.get("warnings"),
        allowed: row.get("allowed"),
        active_devices,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub top_domains: Vec<DomainCount>,
    pub action_breakdown: Vec<(String, i64)>,
}

pub async fn analytics(pool: &SqlitePool) -> ZdnsResult<Analytics> {
    let top_rows = sqlx::query(
        "SELECT domain, COUNT(*) as cnt FROM events GROUP BY domain ORDER BY cnt DESC LIMIT 10",
    )
    .fetch_all(pool)
    .await?;
    let top_domains = top_rows
        .iter()
        .map(|r| DomainCount {
            domain: r.get("domain"),
            count: r.get("cnt"),
        })
        .collect();

    let breakdown_rows = sqlx::query("SELECT action, COUNT(*) as cnt FROM events GROUP BY action")
        .fetch_all(pool)
        .await?;
    let action_breakdown = breakdown_rows
        .iter()
        .map(|r| (r.get::<String, _>("action"), r.get::<i64, _>("cnt")))
        .collect();

    Ok(Analytics {
        top_domains,
        action_breakdown,
    })
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub client_ip: String,
    pub hostname: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
    pub query_count: i64,
    pub blocked_count: i64,
    pub warn_count: i64,
    pub allow_count: i64,
}

impl Device {
    fn from_row(row: &SqliteRow) -> Self {
        Device {
            client_ip: row.get("client_ip"),
            hostname: row.get("hostname"),
            first_seen: row.get("first_seen"),
            last_seen: row.get("last_seen"),
            query_count: row.get("query_count"),
            blocked_count: row.get("blocked_count"),
            warn_count: row.get("warn_count"),
            allow_count: row.get("allow_count"),
        }
    }
}

/// Upserted on every decision. `blocked_count`/`warn_count`/`allow_count`
/// each bump by exactly one of the three per call; `query_count` always
/// bumps.
pub async fn upsert_device(pool: &SqlitePool, client_ip: &str, action: &str) -> ZdnsResult<()> {
    let now = now_iso();
    let (blocked, warn, allow) = match action {
        "BLOCK" => (1, 0, 0),
        "WARN" => (0, 1, 0),
        _ => (0, 0, 1),
    };

    let existing: Option<(String,)> = sqlx::query_as("SELECT client_ip FROM devices WHERE client_ip = ?")
        .bind(client_ip)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        sqlx::query(
            "UPDATE devices SET last_seen = ?, query_count = query_count + 1,
             blocked_count = blocked_count + ?, warn_count = warn_count + ?, allow_count = allow_count + ?
             WHERE client_ip = ?",
        )
        .bind(&now)
        .bind(blocked)
        .bind(warn)
        .bind(allow)
        .bind(client_ip)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "INSERT INTO devices (client_ip, first_seen, last_seen, query_count, blocked_count, warn_count, allow_count)
             VALUES (?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(client_ip)
        .bind(&now)
        .bind(&now)
        .bind(blocked)
        .bind(warn)
        .bind(allow)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn list_devices(pool: &SqlitePool, limit: i64) -> ZdnsResult<Vec<Device>> {
    let rows = sqlx::query("SELECT * FROM devices ORDER BY last_seen DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(Device::from_row).collect())
}

pub async fn active_device_count(pool: &SqlitePool, window_min: i64) -> ZdnsResult<i64> {
    let cutoff = (Utc::now() - chrono::Duration::minutes(window_min)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let row = sqlx::query("SELECT COUNT(*) as cnt FROM devices WHERE last_seen >= ?")
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
    Ok(row.get("cnt"))
}

// ---------------------------------------------------------------------------
// List sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ListSource {
    pub id: i64,
    pub name: String,
    pub list_type: String,
    pub url: String,
    pub enabled: bool,
    pub last_fetched: Option<String>,
    pub last_imported: Option<i64>,
    pub last_error: Option<String>,
}

impl ListSource {
    fn from_row(row: &SqliteRow) -> Self {
        ListSource {
            id: row.get("id"),
            name: row.get("name"),
            list_type: row.get("list_type"),
            url: row.get("url"),
            enabled: row.get::<i64, _>("enabled") != 0,
            last_fetched: row.get("last_fetched"),
            last_imported: row.get("last_imported"),
            last_error: row.get("last_error"),
        }
    }
}

pub async fn list_list_sources(pool: &SqlitePool) -> ZdnsResult<Vec<ListSource>> {
    let rows = sqlx::query("SELECT * FROM list_sources ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(ListSource::from_row).collect())
}

pub async fn create_list_source(
    pool: &SqlitePool,
    name: &str,
    list_type: &str,
    url: &str,
) -> ZdnsResult<i64> {
    let result = sqlx::query(
        "INSERT INTO list_sources (name, list_type, url, enabled) VALUES (?, ?, ?, 1)",
    )
    .bind(name)
    .bind(list_type)
    .bind(url)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn update_list_source(
    pool: &SqlitePool,
    id: i64,
    name: &str,
    list_type: &str,
    url: &str,
    enabled: bool,
) -> ZdnsResult<bool> {
    let result = sqlx::query(
        "UPDATE list_sources SET name = ?, list_type = ?, url = ?, enabled = ? WHERE id = ?",
    )
    .bind(name)
    .bind(list_type)
    .bind(url)
    .bind(enabled as i64)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_list_source(pool: &SqlitePool, id: i64) -> ZdnsResult<bool> {
    let result = sqlx::query("DELETE FROM list_sources WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn record_list_outcome(
    pool: &SqlitePool,
    id: i64,
    imported: Option<i64>,
    error: Option<&str>,
) -> ZdnsResult<()> {
    let now = now_iso();
    sqlx::query(
        "UPDATE list_sources SET last_fetched = ?, last_imported = ?, last_error = ? WHERE id = ?",
    )
    .bind(&now)
    .bind(imported)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// STIX collections & objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StixCollection {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub can_read: bool,
    pub can_write: bool,
    pub created: String,
}

impl StixCollection {
    fn from_row(row: &SqliteRow) -> Self {
        StixCollection {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            can_read: row.get::<i64, _>("can_read") != 0,
            can_write: row.get::<i64, _>("can_write") != 0,
            created: row.get("created"),
        }
    }
}

pub async fn list_collections(pool: &SqlitePool) -> ZdnsResult<Vec<StixCollection>> {
    let rows = sqlx::query("SELECT * FROM stix_collections ORDER BY created ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(StixCollection::from_row).collect())
}

pub async fn get_collection(pool: &SqlitePool, id: &str) -> ZdnsResult<Option<StixCollection>> {
    let row = sqlx::query("SELECT * FROM stix_collections WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| StixCollection::from_row(&r)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StixObjectRow {
    pub id: String,
    pub collection_id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub spec_version: Option<String>,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub added_at: String,
    pub data: serde_json::Value,
}

impl StixObjectRow {
    fn from_row(row: &SqliteRow) -> ZdnsResult<Self> {
        let raw: String = row.get("data");
        let data = serde_json::from_str(&raw)
            .map_err(|e| ZdnsError::StoreError(format!("corrupt stix object json: {e}")))?;
        Ok(StixObjectRow {
            id: row.get("id"),
            collection_id: row.get("collection_id"),
            type_: row.get("type"),
            spec_version: row.get("spec_version"),
            created: row.get("created"),
            modified: row.get("modified"),
            added_at: row.get("added_at"),
            data,
        })
    }
}

/// Upsert keyed on the STIX `id` — repeated ingestion of the same id
/// replaces the stored copy.
pub async fn upsert_stix_object(pool: &SqlitePool, collection_id: &str, obj: &serde_json::Value) -> ZdnsResult<String> {
    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ZdnsError::InputInvalid("stix object missing id".into()))?
        .to_string();
    let type_ = obj.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let spec_version = obj.get("spec_version").and_then(|v| v.as_str()).map(|s| s.to_string());
    let created = obj.get("created").and_then(|v| v.as_str()).map(|s| s.to_string());
    let modified = obj.get("modified").and_then(|v| v.as_str()).map(|s| s.to_string());
    let added_at = now_iso();
    let data = serde_json::to_string(obj)
        .map_err(|e| ZdnsError::InputInvalid(format!("cannot serialize stix object: {e}")))?;

    sqlx::query(
        "INSERT INTO stix_objects (id, collection_id, type, spec_version, created, modified, added_at, data)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            collection_id = excluded.collection_id,
            type = excluded.type,
            spec_version = excluded.spec_version,
            created = excluded.created,
            modified = excluded.modified,
            added_at = excluded.added_at,
            data = excluded.data",
    )
    .bind(&id)
    .bind(collection_id)
    .bind(&type_)
    .bind(&spec_version)
    .bind(&created)
    .bind(&modified)
    .bind(&added_at)
    .bind(&data)
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn list_stix_objects(
    pool: &SqlitePool,
    collection_id: &str,
    added_after: Option<&str>,
    limit: i64,
) -> ZdnsResult<Vec<StixObjectRow>> {
    let limit = limit.clamp(1, 500);
    let rows = if let Some(after) = added_after {
        sqlx::query(
            "SELECT * FROM stix_objects WHERE collection_id = ? AND added_at > ? ORDER BY added_at ASC LIMIT ?",
        )
        .bind(collection_id)
        .bind(after)
        .bind(limit)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query("SELECT * FROM stix_objects WHERE collection_id = ? ORDER BY added_at ASC LIMIT ?")
            .bind(collection_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
    };
    rows.iter().map(StixObjectRow::from_row).collect()
}

pub async fn list_indicators(pool: &SqlitePool, collection_id: &str) -> ZdnsResult<Vec<StixObjectRow>> {
    let rows = sqlx::query(
        "SELECT * FROM stix_objects WHERE collection_id = ? AND type = 'indicator' ORDER BY added_at ASC",
    )
    .bind(collection_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(StixObjectRow::from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_store() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_tables(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        ensure_default_collection(&pool).await.unwrap();
        ensure_metrics_row(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn default_collection_materializes_once() {
        let pool = mem_store().await;
        let collections = list_collections(&pool).await.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].id, DEFAULT_COLLECTION_ID);
    }

    #[tokio::test]
    async fn rule_upsert_by_pattern_preserves_id() {
        let pool = mem_store().await;
        let rule = NewRule {
            name: Some("ads".into()),
            pattern: "ads.example".into(),
            match_type: MatchType::Suffix,
            action: Action::Block,
            enabled: true,
            priority: 10,
            notes: None,
            source: "admin".into(),
            expires_at: None,
        };
        let id1 = upsert_rule_by_pattern(&pool, &rule).await.unwrap();
        let mut updated = rule.clone();
        updated.priority = 20;
        let id2 = upsert_rule_by_pattern(&pool, &updated).await.unwrap();
        assert_eq!(id1, id2);
        let got = get_rule(&pool, id1).await.unwrap().unwrap();
        assert_eq!(got.priority, 20);
    }

    #[tokio::test]
    async fn event_append_bumps_metrics_and_device() {
        let pool = mem_store().await;
        let event = NewEvent {
            ray_id: "RAY-deadbeef".into(),
            domain: "evil.test".into(),
            score: 1.0,
            action: "BLOCK".into(),
            timestamp: now_iso(),
            source: "admin".into(),
            client_ip: Some("10.0.0.5".into()),
            rule_id: None,
            rule_action: None,
            label: Some("ADMIN_RULE".into()),
            qtype: Some("A".into()),
            raw_json: None,
        };
        append_event(&pool, &event).await.unwrap();
        upsert_device(&pool, "10.0.0.5", "BLOCK").await.unwrap();

        let metrics = read_metrics(&pool, 60).await.unwrap();
        assert_eq!(metrics.total_queries, 1);
        assert_eq!(metrics.blocked, 1);

        let devices = list_devices(&pool, 10).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].blocked_count, 1);
    }

    #[tokio::test]
    async fn stix_object_upsert_replaces_by_id() {
        let pool = mem_store().await;
        let obj = serde_json::json!({
            "id": "indicator--abc",
            "type": "indicator",
            "pattern": "[domain-name:value = 'evil.test']",
        });
        upsert_stix_object(&pool, DEFAULT_COLLECTION_ID, &obj).await.unwrap();
        let updated = serde_json::json!({
            "id": "indicator--abc",
            "type": "indicator",
            "pattern": "[domain-name:value = 'evil2.test']",
        });
        upsert_stix_object(&pool, DEFAULT_COLLECTION_ID, &updated).await.unwrap();

        let objs = list_stix_objects(&pool, DEFAULT_COLLECTION_ID, None, 10).await.unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].data["pattern"], "[domain-name:value = 'evil2.test']");
    }
}
