//! Async, `Send`-safe persistence on top of sqlx + SQLite.
//!
//! Every write that participates in a reconciliation invariant uses a
//! conditional `UPDATE ... WHERE status = ?` rather than a blind write, so
//! the event-handler path and the reaper path can race safely.

mod calls;
mod campaigns;
mod callerid;

pub use calls::*;
pub use campaigns::*;
pub use callerid::*;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::Result;
use crate::models::{BlacklistEntry, Project, Trunk};

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(dsn: &str) -> Result<Self> {
        info!(dsn, "connecting to database");
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            crate::error::EngineError::Database(sqlx::Error::Migrate(Box::new(e)))
        })?;
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, caller_id, prompt_audio, prompt_duration_secs, expected_digit, \
             transfer_destination, preferred_trunk, dial_prefix, authorized_ips, max_retries, \
             retry_backoff_secs, amd_enabled, smart_cid_enabled FROM proyectos WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Project {
            id: r.get("id"),
            name: r.get("name"),
            caller_id: r.get("caller_id"),
            prompt_audio: r.get("prompt_audio"),
            prompt_duration_secs: r.get("prompt_duration_secs"),
            expected_digit: r
                .get::<String, _>("expected_digit")
                .chars()
                .next()
                .unwrap_or('1'),
            transfer_destination: r.get("transfer_destination"),
            preferred_trunk: r.get("preferred_trunk"),
            dial_prefix: r.get("dial_prefix"),
            authorized_ips: serde_json::from_str(&r.get::<String, _>("authorized_ips"))
                .unwrap_or_default(),
            max_retries: r.get("max_retries"),
            retry_backoff_secs: r.get("retry_backoff_secs"),
            amd_enabled: r.get::<i64, _>("amd_enabled") != 0,
            smart_cid_enabled: r.get::<i64, _>("smart_cid_enabled") != 0,
        }))
    }

    pub async fn insert_project(&self, p: &Project) -> Result<i64> {
        let ips = serde_json::to_string(&p.authorized_ips).unwrap_or_else(|_| "[]".to_string());
        let id = sqlx::query(
            "INSERT INTO proyectos (name, caller_id, prompt_audio, prompt_duration_secs, \
             expected_digit, transfer_destination, preferred_trunk, dial_prefix, authorized_ips, \
             max_retries, retry_backoff_secs, amd_enabled, smart_cid_enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&p.name)
        .bind(&p.caller_id)
        .bind(&p.prompt_audio)
        .bind(p.prompt_duration_secs)
        .bind(p.expected_digit.to_string())
        .bind(&p.transfer_destination)
        .bind(&p.preferred_trunk)
        .bind(&p.dial_prefix)
        .bind(ips)
        .bind(p.max_retries)
        .bind(p.retry_backoff_secs)
        .bind(p.amd_enabled as i64)
        .bind(p.smart_cid_enabled as i64)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT id FROM proyectos ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut projects = Vec::new();
        for row in rows {
            if let Some(p) = self.get_project(row.get("id")).await? {
                projects.push(p);
            }
        }
        Ok(projects)
    }

    pub async fn delete_project(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM proyectos WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_trunks_for_project(&self, project_id: i64) -> Result<Vec<Trunk>> {
        let rows = sqlx::query(
            "SELECT t.id, t.name, t.host, t.port, t.username, t.secret, t.context, \
             t.caller_id_override, t.active, t.max_channels \
             FROM troncales t JOIN proyecto_troncal pt ON pt.trunk_id = t.id \
             WHERE pt.project_id = ? AND t.active = 1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_trunk).collect())
    }

    pub async fn list_trunks(&self) -> Result<Vec<Trunk>> {
        let rows = sqlx::query(
            "SELECT id, name, host, port, username, secret, context, caller_id_override, \
             active, max_channels FROM troncales ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_trunk).collect())
    }

    pub async fn insert_trunk(&self, t: &Trunk) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO troncales (name, host, port, username, secret, context, \
             caller_id_override, active, max_channels) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&t.name)
        .bind(&t.host)
        .bind(t.port as i64)
        .bind(&t.username)
        .bind(&t.secret)
        .bind(&t.context)
        .bind(&t.caller_id_override)
        .bind(t.active as i64)
        .bind(t.max_channels as i64)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn delete_trunk(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM troncales WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn link_project_trunk(&self, project_id: i64, trunk_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO proyecto_troncal (project_id, trunk_id) VALUES (?, ?)",
        )
        .bind(project_id)
        .bind(trunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A phone in the project's blacklist must never be admitted. Checked
    /// pre-admission, no side effects.
    pub async fn is_blacklisted(&self, project_id: i64, phone: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blacklist WHERE project_id = ? AND phone = ?")
            .bind(project_id)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn add_to_blacklist(&self, entry: &BlacklistEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO blacklist (project_id, phone, reason) VALUES (?, ?, ?) \
             ON CONFLICT(project_id, phone) DO UPDATE SET reason = excluded.reason",
        )
        .bind(entry.project_id)
        .bind(&entry.phone)
        .bind(&entry.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_blacklist(&self, project_id: i64) -> Result<Vec<BlacklistEntry>> {
        let rows = sqlx::query("SELECT project_id, phone, reason FROM blacklist WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| BlacklistEntry {
                project_id: r.get("project_id"),
                phone: r.get("phone"),
                reason: r.get("reason"),
            })
            .collect())
    }

    /// Row overrides from the `config` table, which win over file defaults
    /// at startup.
    pub async fn get_config_overrides(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.get("key"), r.get("value"))).collect())
    }
}

fn row_to_trunk(r: sqlx::sqlite::SqliteRow) -> Trunk {
    Trunk {
        id: r.get("id"),
        name: r.get("name"),
        host: r.get("host"),
        port: r.get::<i64, _>("port") as u16,
        username: r.get("username"),
        secret: r.get("secret"),
        context: r.get("context"),
        caller_id_override: r.get("caller_id_override"),
        active: r.get::<i64, _>("active") != 0,
        max_channels: r.get::<i64, _>("max_channels") as u32,
    }
}
