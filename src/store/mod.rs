pub mod schema;
pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::error::ManagerError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Oldest activity events beyond this cap are evicted on insert (FIFO).
pub const ACTIVITY_LOG_CAP: usize = 1000;

type Result<T> = std::result::Result<T, ManagerError>;

/// Single-file relational store for all durable manager state.
///
/// One writer lane: every call takes the connection mutex for the duration of
/// its statement(s), so calls from the scheduler, the verifier and the control
/// surface serialize at this boundary. Readers return snapshots — no locks
/// escape.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ManagerError::Fatal(format!("open database {}: {}", path.display(), e)))?;
        schema::init(&conn)?;
        debug!("store: opened, path={}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh in-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ManagerError::Fatal(format!("open in-memory database: {}", e)))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub fn get_nodes(&self, status: NodeStatus) -> Result<Vec<Node>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, tag, name, source_tag, node_type, server, port, settings,
                    country_code, country_flag, status, consecutive_failures, favorite,
                    created_at, updated_at, last_checked_at, archived_at
             FROM nodes WHERE status = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], node_from_row)?;
        collect_rows(rows)
    }

    pub fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, tag, name, source_tag, node_type, server, port, settings,
                    country_code, country_flag, status, consecutive_failures, favorite,
                    created_at, updated_at, last_checked_at, archived_at
             FROM nodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], node_from_row)?;
        collect_rows(rows)
    }

    pub fn get_node(&self, id: i64) -> Result<Node> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, tag, name, source_tag, node_type, server, port, settings,
                    country_code, country_flag, status, consecutive_failures, favorite,
                    created_at, updated_at, last_checked_at, archived_at
             FROM nodes WHERE id = ?1",
            params![id],
            node_from_row,
        )
        .optional()?
        .ok_or_else(|| ManagerError::NotFound(format!("node {}", id)))
    }

    pub fn find_node(&self, server: &str, port: u16) -> Result<Option<Node>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id, tag, name, source_tag, node_type, server, port, settings,
                        country_code, country_flag, status, consecutive_failures, favorite,
                        created_at, updated_at, last_checked_at, archived_at
                 FROM nodes WHERE server = ?1 AND port = ?2",
                params![server, port as i64],
                node_from_row,
            )
            .optional()?)
    }

    pub fn get_nodes_by_source(&self, source_tag: &str) -> Result<Vec<Node>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, tag, name, source_tag, node_type, server, port, settings,
                    country_code, country_flag, status, consecutive_failures, favorite,
                    created_at, updated_at, last_checked_at, archived_at
             FROM nodes WHERE source_tag = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_tag], node_from_row)?;
        collect_rows(rows)
    }

    pub fn count_nodes_by_status(&self) -> Result<(usize, usize, usize)> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM nodes GROUP BY status")?;
        let mut pending = 0;
        let mut verified = 0;
        let mut archived = 0;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => pending = count as usize,
                "verified" => verified = count as usize,
                "archived" => archived = count as usize,
                _ => {}
            }
        }
        Ok((pending, verified, archived))
    }

    /// Insert or update candidates in a single transaction, deduplicating on
    /// `(server, port)`.
    ///
    /// Existing rows get a refreshed source_tag, type, country and settings
    /// blob; their status and failure counter are left untouched. New rows
    /// enter as `pending` with counter 0. Returns the number of inserts.
    pub fn add_nodes_bulk(&self, candidates: &[NodeCandidate]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ms();
        let mut inserted = 0;

        for c in candidates {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM nodes WHERE server = ?1 AND port = ?2",
                    params![c.server, c.port as i64],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE nodes SET source_tag = ?1, node_type = ?2,
                                country_code = ?3, country_flag = ?4,
                                settings = ?5, updated_at = ?6
                         WHERE id = ?7",
                        params![
                            c.source_tag,
                            c.node_type,
                            c.country_code,
                            c.country_flag,
                            c.settings.to_string(),
                            now,
                            id
                        ],
                    )?;
                }
                None => {
                    let tag = unique_tag(&tx, &c.tag)?;
                    let name = if c.name.is_empty() { tag.clone() } else { c.name.clone() };
                    tx.execute(
                        "INSERT INTO nodes (tag, name, source_tag, node_type, server, port,
                                settings, country_code, country_flag, status,
                                consecutive_failures, favorite, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, 0, ?10, ?10)",
                        params![
                            tag,
                            name,
                            c.source_tag,
                            c.node_type,
                            c.server,
                            c.port as i64,
                            c.settings.to_string(),
                            c.country_code,
                            c.country_flag,
                            now
                        ],
                    )?;
                    inserted += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            "store: bulk upsert, candidates={}, inserted={}",
            candidates.len(),
            inserted
        );
        Ok(inserted)
    }

    /// pending → verified. Resets the failure counter and stamps
    /// `last_checked_at`. `Conflict` if the node is not pending.
    pub fn promote_node(&self, id: i64) -> Result<()> {
        self.transition(id, NodeStatus::Pending, NodeStatus::Verified, true, true)
    }

    /// verified → pending. The failure counter is NOT reset.
    pub fn demote_node(&self, id: i64) -> Result<()> {
        self.transition(id, NodeStatus::Verified, NodeStatus::Pending, false, false)
    }

    /// any → archived, stamping `archived_at`.
    pub fn archive_node(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE nodes SET status = 'archived', archived_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    /// archived → pending; the only way back from the terminal state.
    pub fn unarchive_node(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE nodes SET status = 'pending', archived_at = NULL,
                    consecutive_failures = 0, updated_at = ?1
             WHERE id = ?2 AND status = 'archived'",
            params![now, id],
        )?;
        if changed == 0 {
            return self.transition_error(&conn, id, "archived");
        }
        Ok(())
    }

    fn transition(
        &self,
        id: i64,
        from: NodeStatus,
        to: NodeStatus,
        reset_failures: bool,
        stamp_checked: bool,
    ) -> Result<()> {
        let conn = self.conn();
        let now = now_ms();
        let changed = if reset_failures && stamp_checked {
            conn.execute(
                "UPDATE nodes SET status = ?1, consecutive_failures = 0,
                        last_checked_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?
        } else {
            conn.execute(
                "UPDATE nodes SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?
        };
        if changed == 0 {
            return self.transition_error(&conn, id, from.as_str());
        }
        Ok(())
    }

    fn transition_error(&self, conn: &Connection, id: i64, expected: &str) -> Result<()> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(ManagerError::NotFound(format!("node {}", id))),
            Some(status) => Err(ManagerError::Conflict(format!(
                "node {} is {}, expected {}",
                id, status, expected
            ))),
        }
    }

    /// Atomic read-modify-write; returns the new count.
    pub fn increment_consecutive_failures(&self, id: i64) -> Result<u32> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET consecutive_failures = consecutive_failures + 1,
                    last_checked_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now_ms(), id],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("node {}", id)));
        }
        let count: i64 = conn.query_row(
            "SELECT consecutive_failures FROM nodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn reset_consecutive_failures(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET consecutive_failures = 0, last_checked_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now_ms(), id],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    pub fn set_favorite(&self, id: i64, favorite: bool) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET favorite = ?1, updated_at = ?2 WHERE id = ?3",
            params![favorite as i64, now_ms(), id],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    pub fn delete_node(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("node {}", id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Measurements
    // -----------------------------------------------------------------------

    /// Append-only; zero timestamps are defaulted to now. Submission order is
    /// preserved within the batch.
    pub fn add_health_measurements(&self, batch: &[HealthMeasurement]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ms();
        for m in batch {
            let ts = if m.timestamp == 0 { now } else { m.timestamp };
            tx.execute(
                "INSERT INTO health_measurements (server, port, tag, timestamp, alive,
                        latency_ms, mode)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    m.server,
                    m.port as i64,
                    m.tag,
                    ts,
                    m.alive as i64,
                    m.latency_ms as i64,
                    m.mode.as_str()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn add_site_measurements(&self, batch: &[SiteMeasurement]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ms();
        for m in batch {
            let ts = if m.timestamp == 0 { now } else { m.timestamp };
            tx.execute(
                "INSERT INTO site_measurements (server, port, tag, timestamp, site,
                        delay_ms, mode)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    m.server,
                    m.port as i64,
                    m.tag,
                    ts,
                    m.site,
                    m.delay_ms,
                    m.mode.as_str()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Newest health row per `(server, port)`, newest first.
    pub fn get_latest_measurements(&self, limit: usize) -> Result<Vec<HealthMeasurement>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT h.server, h.port, h.tag, h.timestamp, h.alive, h.latency_ms, h.mode
             FROM health_measurements h
             JOIN (SELECT server, port, MAX(id) AS max_id
                   FROM health_measurements GROUP BY server, port) latest
               ON h.id = latest.max_id
             ORDER BY h.id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HealthMeasurement {
                server: row.get(0)?,
                port: row.get::<_, i64>(1)? as u16,
                tag: row.get(2)?,
                timestamp: row.get(3)?,
                alive: row.get::<_, i64>(4)? != 0,
                latency_ms: row.get::<_, i64>(5)? as u32,
                mode: MeasureMode::parse(&row.get::<_, String>(6)?)
                    .unwrap_or(MeasureMode::Tcp),
            })
        })?;
        collect_rows(rows)
    }

    pub fn health_measurements_for(&self, server: &str, port: u16) -> Result<Vec<HealthMeasurement>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT server, port, tag, timestamp, alive, latency_ms, mode
             FROM health_measurements WHERE server = ?1 AND port = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![server, port as i64], |row| {
            Ok(HealthMeasurement {
                server: row.get(0)?,
                port: row.get::<_, i64>(1)? as u16,
                tag: row.get(2)?,
                timestamp: row.get(3)?,
                alive: row.get::<_, i64>(4)? != 0,
                latency_ms: row.get::<_, i64>(5)? as u32,
                mode: MeasureMode::parse(&row.get::<_, String>(6)?)
                    .unwrap_or(MeasureMode::Tcp),
            })
        })?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Run logs, activity, unsupported nodes
    // -----------------------------------------------------------------------

    pub fn add_verification_log(&self, run: &VerificationRun) -> Result<()> {
        let conn = self.conn();
        let started = if run.started_at == 0 { now_ms() } else { run.started_at };
        conn.execute(
            "INSERT INTO verification_logs (started_at, pending_checked, pending_promoted,
                    pending_archived, verified_checked, verified_demoted, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                started,
                run.pending_checked as i64,
                run.pending_promoted as i64,
                run.pending_archived as i64,
                run.verified_checked as i64,
                run.verified_demoted as i64,
                run.duration_ms as i64,
                run.error
            ],
        )?;
        Ok(())
    }

    pub fn get_verification_logs(&self, limit: usize) -> Result<Vec<VerificationRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT started_at, pending_checked, pending_promoted, pending_archived,
                    verified_checked, verified_demoted, duration_ms, error
             FROM verification_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(VerificationRun {
                started_at: row.get(0)?,
                pending_checked: row.get::<_, i64>(1)? as u32,
                pending_promoted: row.get::<_, i64>(2)? as u32,
                pending_archived: row.get::<_, i64>(3)? as u32,
                verified_checked: row.get::<_, i64>(4)? as u32,
                verified_demoted: row.get::<_, i64>(5)? as u32,
                duration_ms: row.get::<_, i64>(6)? as u64,
                error: row.get(7)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Append one event and evict everything past `ACTIVITY_LOG_CAP`, oldest
    /// first.
    pub fn add_activity_event(&self, event_type: &str, message: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO activity_log (event_type, message, timestamp) VALUES (?1, ?2, ?3)",
            params![event_type, message, now_ms()],
        )?;
        tx.execute(
            "DELETE FROM activity_log WHERE id NOT IN
                (SELECT id FROM activity_log ORDER BY id DESC LIMIT ?1)",
            params![ACTIVITY_LOG_CAP as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_activity_events(&self, limit: usize) -> Result<Vec<ActivityEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_type, message, timestamp
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ActivityEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                message: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn add_unsupported_node(&self, entry: &UnsupportedNode) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO unsupported_nodes (tag, server, port, reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entry.tag, entry.server, entry.port as i64, entry.reason, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_unsupported_nodes(&self, limit: usize) -> Result<Vec<UnsupportedNode>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT tag, server, port, reason FROM unsupported_nodes
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(UnsupportedNode {
                tag: row.get(0)?,
                server: row.get(1)?,
                port: row.get::<_, i64>(2)? as u16,
                reason: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn add_subscription(&self, name: &str, url: &str, pipeline: &PipelineSettings) -> Result<Subscription> {
        if name.is_empty() || url.is_empty() {
            return Err(ManagerError::InvalidArgument(
                "subscription name and url are required".to_string(),
            ));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO subscriptions (name, url, enabled, pipeline) VALUES (?1, ?2, 1, ?3)",
            params![name, url, serde_json::to_string(pipeline)?],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ManagerError::Conflict(format!("subscription {} already exists", name))
            }
            other => other.into(),
        })?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_subscription(id)
    }

    pub fn get_subscription(&self, id: i64) -> Result<Subscription> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, url, enabled, last_updated_at, traffic, pipeline
             FROM subscriptions WHERE id = ?1",
            params![id],
            subscription_from_row,
        )
        .optional()?
        .ok_or_else(|| ManagerError::NotFound(format!("subscription {}", id)))
    }

    pub fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, last_updated_at, traffic, pipeline
             FROM subscriptions ORDER BY id",
        )?;
        let rows = stmt.query_map([], subscription_from_row)?;
        collect_rows(rows)
    }

    pub fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE subscriptions SET name = ?1, url = ?2, enabled = ?3, pipeline = ?4
             WHERE id = ?5",
            params![
                sub.name,
                sub.url,
                sub.enabled as i64,
                serde_json::to_string(&sub.pipeline)?,
                sub.id
            ],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("subscription {}", sub.id)));
        }
        Ok(())
    }

    /// Stamp a completed refresh and record provider traffic metadata.
    pub fn touch_subscription(&self, id: i64, traffic: Option<&TrafficInfo>) -> Result<()> {
        let conn = self.conn();
        let traffic_json = match traffic {
            Some(t) => Some(serde_json::to_string(t)?),
            None => None,
        };
        let changed = conn.execute(
            "UPDATE subscriptions SET last_updated_at = ?1,
                    traffic = COALESCE(?2, traffic)
             WHERE id = ?3",
            params![now_ms(), traffic_json, id],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("subscription {}", id)));
        }
        Ok(())
    }

    pub fn delete_subscription(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("subscription {}", id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Filters & rule groups
    // -----------------------------------------------------------------------

    pub fn add_filter(&self, f: &Filter) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO filters (name, target_group, include, exclude) VALUES (?1, ?2, ?3, ?4)",
            params![
                f.name,
                f.target_group,
                serde_json::to_string(&f.include)?,
                serde_json::to_string(&f.exclude)?
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_filters(&self) -> Result<Vec<Filter>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, name, target_group, include, exclude FROM filters ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Filter {
                id: row.get(0)?,
                name: row.get(1)?,
                target_group: row.get(2)?,
                include: json_list(row.get::<_, String>(3)?),
                exclude: json_list(row.get::<_, String>(4)?),
            })
        })?;
        collect_rows(rows)
    }

    pub fn delete_filter(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM filters WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("filter {}", id)));
        }
        Ok(())
    }

    pub fn add_rule_group(&self, g: &RuleGroup) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO rule_groups (name, outbound_tag, rules) VALUES (?1, ?2, ?3)",
            params![g.name, g.outbound_tag, serde_json::to_string(&g.rules)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_rule_groups(&self) -> Result<Vec<RuleGroup>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, name, outbound_tag, rules FROM rule_groups ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(RuleGroup {
                id: row.get(0)?,
                name: row.get(1)?,
                outbound_tag: row.get(2)?,
                rules: json_list(row.get::<_, String>(3)?),
            })
        })?;
        collect_rows(rows)
    }

    pub fn delete_rule_group(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM rule_groups WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("rule group {}", id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_settings(&self) -> Result<Settings> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row("SELECT data FROM settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match data {
            Some(json) => Ok(serde_json::from_str(&json)
                .map_err(|e| ManagerError::Fatal(format!("settings row corrupt: {}", e)))?),
            None => Ok(Settings::default()),
        }
    }

    /// Normalize against the currently effective settings, persist, and
    /// return the effective result.
    pub fn update_settings(&self, new: Settings) -> Result<Settings> {
        let previous = self.get_settings()?;
        let effective = new.normalize(&previous);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (id, data) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET data = excluded.data",
            params![serde_json::to_string(&effective)?],
        )?;
        Ok(effective)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let settings: String = row.get(7)?;
    let status: String = row.get(10)?;
    Ok(Node {
        id: row.get(0)?,
        tag: row.get(1)?,
        name: row.get(2)?,
        source_tag: row.get(3)?,
        node_type: row.get(4)?,
        server: row.get(5)?,
        port: row.get::<_, i64>(6)? as u16,
        settings: serde_json::from_str(&settings).unwrap_or(serde_json::Value::Null),
        country_code: row.get(8)?,
        country_flag: row.get(9)?,
        status: NodeStatus::parse(&status).unwrap_or(NodeStatus::Pending),
        consecutive_failures: row.get::<_, i64>(11)? as u32,
        favorite: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        last_checked_at: row.get(15)?,
        archived_at: row.get(16)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let traffic: Option<String> = row.get(5)?;
    let pipeline: String = row.get(6)?;
    Ok(Subscription {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        last_updated_at: row.get(4)?,
        traffic: traffic.and_then(|t| serde_json::from_str(&t).ok()),
        pipeline: serde_json::from_str(&pipeline).unwrap_or_default(),
    })
}

fn json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> std::result::Result<Vec<T>, ManagerError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Tags are unique across the table; candidates from different sources can
/// collide, so suffix until free.
fn unique_tag(conn: &Connection, base: &str) -> rusqlite::Result<String> {
    let base = if base.is_empty() { "node" } else { base };
    let mut tag = base.to_string();
    let mut n = 1;
    loop {
        let taken: Option<i64> = conn
            .query_row("SELECT id FROM nodes WHERE tag = ?1", params![tag], |row| row.get(0))
            .optional()?;
        if taken.is_none() {
            return Ok(tag);
        }
        n += 1;
        tag = format!("{}-{}", base, n);
    }
}
