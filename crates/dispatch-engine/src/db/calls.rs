use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DatabaseManager;
use crate::error::Result;
use crate::models::{CallLog, CallStatus};

impl DatabaseManager {
    /// Inserts the initial `dialing` row for an admitted call. `status` is
    /// left `NULL` until a terminal transition.
    pub async fn insert_call_log_dialing(
        &self,
        project_id: i64,
        phone: &str,
        campaign_id: Option<i64>,
        contact_id: Option<i64>,
        caller_id: &str,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO call_log (project_id, phone, campaign_id, contact_id, caller_id) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(phone)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(caller_id)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Conditional terminal update: only rows still in `dialing` (status
    /// `NULL`) transition. A second caller racing to finalize the same row
    /// (event handler vs. reaper) is a no-op, keeping exactly one terminal
    /// status per row.
    pub async fn finalize_call_log(
        &self,
        id: i64,
        status: CallStatus,
        dtmf: Option<&str>,
        interacted: bool,
        duration_secs: Option<i64>,
        unique_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE call_log SET status = ?, dtmf = ?, interacted = ?, duration_secs = ?, \
             unique_id = COALESCE(?, unique_id) WHERE id = ? AND status IS NULL",
        )
        .bind(status.as_str())
        .bind(dtmf)
        .bind(interacted as i64)
        .bind(duration_secs)
        .bind(unique_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_call_log(&self, id: i64) -> Result<Option<CallLog>> {
        let row = sqlx::query(
            "SELECT id, project_id, phone, campaign_id, contact_id, caller_id, dtmf, interacted, \
             status, duration_secs, unique_id, created_at FROM call_log WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_call_log))
    }

    /// `dialing` rows older than `horizon` — candidates for orphan
    /// reconciliation.
    pub async fn dialing_older_than(&self, horizon: DateTime<Utc>) -> Result<Vec<CallLog>> {
        let rows = sqlx::query(
            "SELECT id, project_id, phone, campaign_id, contact_id, caller_id, dtmf, interacted, \
             status, duration_secs, unique_id, created_at FROM call_log \
             WHERE status IS NULL AND created_at < ?",
        )
        .bind(horizon.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_call_log).collect())
    }
}

fn row_to_call_log(r: sqlx::sqlite::SqliteRow) -> CallLog {
    CallLog {
        id: r.get("id"),
        project_id: r.get("project_id"),
        phone: r.get("phone"),
        campaign_id: r.get("campaign_id"),
        contact_id: r.get("contact_id"),
        caller_id: r.get("caller_id"),
        dtmf: r.get("dtmf"),
        interacted: r.get::<i64, _>("interacted") != 0,
        status: r
            .get::<Option<String>, _>("status")
            .and_then(|s| CallStatus::from_str(&s)),
        duration_secs: r.get("duration_secs"),
        unique_id: r.get("unique_id"),
        created_at: r
            .get::<String, _>("created_at")
            .parse()
            .unwrap_or_else(|_| Utc::now()),
    }
}
