use rusqlite::Connection;

/// Bump when a statement below changes shape. Stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL DEFAULT '',
        source_tag TEXT NOT NULL DEFAULT 'manual',
        node_type TEXT NOT NULL,
        server TEXT NOT NULL,
        port INTEGER NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        country_code TEXT NOT NULL DEFAULT '',
        country_flag TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        consecutive_failures INTEGER NOT NULL DEFAULT 0
            CHECK (consecutive_failures >= 0),
        favorite INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_checked_at INTEGER,
        archived_at INTEGER,
        UNIQUE (server, port)
    )",
    "CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes (status)",
    "CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_updated_at INTEGER,
        traffic TEXT,
        pipeline TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS filters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        target_group TEXT NOT NULL,
        include TEXT NOT NULL DEFAULT '[]',
        exclude TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS rule_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        outbound_tag TEXT NOT NULL,
        rules TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS health_measurements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server TEXT NOT NULL,
        port INTEGER NOT NULL,
        tag TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        alive INTEGER NOT NULL,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        mode TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_health_endpoint
        ON health_measurements (server, port, id)",
    "CREATE TABLE IF NOT EXISTS site_measurements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server TEXT NOT NULL,
        port INTEGER NOT NULL,
        tag TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        site TEXT NOT NULL,
        delay_ms INTEGER NOT NULL,
        mode TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_site_endpoint
        ON site_measurements (server, port, id)",
    "CREATE TABLE IF NOT EXISTS verification_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at INTEGER NOT NULL,
        pending_checked INTEGER NOT NULL DEFAULT 0,
        pending_promoted INTEGER NOT NULL DEFAULT 0,
        pending_archived INTEGER NOT NULL DEFAULT 0,
        verified_checked INTEGER NOT NULL DEFAULT 0,
        verified_demoted INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS activity_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS unsupported_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL,
        server TEXT NOT NULL,
        port INTEGER NOT NULL,
        reason TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        data TEXT NOT NULL
    )",
];

/// Create all tables and indices. Idempotent.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row; in-memory databases
    // answer "memory" instead of "wal".
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    for stmt in DDL {
        conn.execute(stmt, [])?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
