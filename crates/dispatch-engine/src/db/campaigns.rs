use std::collections::HashMap;

use chrono::Utc;
use sqlx::Row;

use super::DatabaseManager;
use crate::error::Result;
use crate::models::{Campaign, CampaignState, Contact, ContactState, Schedule};

impl DatabaseManager {
    pub async fn get_active_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            "SELECT id, name, project_id, state, total, processed, succeeded, failed \
             FROM campaigns WHERE state = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_campaign).collect())
    }

    pub async fn insert_campaign(&self, c: &Campaign) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO campaigns (name, project_id, state, total) VALUES (?, ?, ?, ?)",
        )
        .bind(&c.name)
        .bind(c.project_id)
        .bind(c.state.as_str())
        .bind(c.total)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn set_campaign_state(&self, campaign_id: i64, state: CampaignState) -> Result<()> {
        sqlx::query("UPDATE campaigns SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_schedules(&self, campaign_id: i64) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT campaign_id, day_of_week, start_time, end_time, active \
             FROM campaign_schedules WHERE campaign_id = ? AND active = 1",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Schedule {
                campaign_id: r.get("campaign_id"),
                day_of_week: r.get::<i64, _>("day_of_week") as u8,
                start: r
                    .get::<String, _>("start_time")
                    .parse()
                    .unwrap_or(chrono::NaiveTime::MIN),
                end: r
                    .get::<String, _>("end_time")
                    .parse()
                    .unwrap_or(chrono::NaiveTime::MIN),
                active: r.get::<i64, _>("active") != 0,
            })
            .collect())
    }

    pub async fn upsert_schedule(&self, s: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_schedules (campaign_id, day_of_week, start_time, end_time, active) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(campaign_id, day_of_week) DO UPDATE SET \
             start_time = excluded.start_time, end_time = excluded.end_time, active = excluded.active",
        )
        .bind(s.campaign_id)
        .bind(s.day_of_week as i64)
        .bind(s.start.to_string())
        .bind(s.end.to_string())
        .bind(s.active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_contact(&self, campaign_id: i64, phone: &str, extra: &HashMap<String, String>) -> Result<i64> {
        let extra_json = serde_json::to_string(extra).unwrap_or_else(|_| "{}".to_string());
        let id = sqlx::query("INSERT INTO campaign_contacts (campaign_id, phone, extra) VALUES (?, ?, ?)")
            .bind(campaign_id)
            .bind(phone)
            .bind(extra_json)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        sqlx::query("UPDATE campaigns SET total = total + 1 WHERE id = ?")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    /// Conditional claim (`pending` → `dialing`) ordered by id, preventing
    /// double-dialing across overlapping sweeps and restarts.
    pub async fn claim_pending_contacts(&self, campaign_id: i64, limit: u32) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "UPDATE campaign_contacts SET state = 'dialing', last_attempt = ? \
             WHERE id IN ( \
                 SELECT id FROM campaign_contacts \
                 WHERE campaign_id = ? AND state = 'pending' \
                 ORDER BY id LIMIT ? \
             ) RETURNING id, campaign_id, phone, extra, state, attempts, last_attempt, result",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(campaign_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_contact).collect())
    }

    pub async fn revert_contact_to_pending(&self, contact_id: i64) -> Result<()> {
        sqlx::query("UPDATE campaign_contacts SET state = 'pending' WHERE id = ?")
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bumps attempts; sets `failed` once `attempts >= max_retries`,
    /// otherwise back to `pending` for the next sweep.
    pub async fn fail_contact_attempt(&self, contact_id: i64, max_retries: i32, result: &str) -> Result<ContactState> {
        let row = sqlx::query("SELECT attempts FROM campaign_contacts WHERE id = ?")
            .bind(contact_id)
            .fetch_one(&self.pool)
            .await?;
        let attempts: i32 = row.get::<i64, _>("attempts") as i32 + 1;
        let next_state = if attempts >= max_retries {
            ContactState::Failed
        } else {
            ContactState::Pending
        };
        sqlx::query("UPDATE campaign_contacts SET attempts = ?, state = ?, result = ?, last_attempt = ? WHERE id = ?")
            .bind(attempts as i64)
            .bind(next_state.as_str())
            .bind(result)
            .bind(Utc::now().to_rfc3339())
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        if next_state == ContactState::Failed {
            self.bump_campaign_counters(contact_id, false).await?;
            self.maybe_complete_campaign_for_contact(contact_id).await?;
        }
        Ok(next_state)
    }

    /// Completion hook from the event handler.
    pub async fn complete_contact(&self, contact_id: i64, success: bool, result: &str) -> Result<()> {
        let state = if success { ContactState::Completed } else { ContactState::Failed };
        sqlx::query("UPDATE campaign_contacts SET state = ?, result = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(result)
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        self.bump_campaign_counters(contact_id, success).await?;
        self.maybe_complete_campaign_for_contact(contact_id).await?;
        Ok(())
    }

    async fn bump_campaign_counters(&self, contact_id: i64, success: bool) -> Result<()> {
        let row = sqlx::query("SELECT campaign_id FROM campaign_contacts WHERE id = ?")
            .bind(contact_id)
            .fetch_one(&self.pool)
            .await?;
        let campaign_id: i64 = row.get("campaign_id");
        if success {
            sqlx::query("UPDATE campaigns SET processed = processed + 1, succeeded = succeeded + 1 WHERE id = ?")
                .bind(campaign_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE campaigns SET processed = processed + 1, failed = failed + 1 WHERE id = ?")
                .bind(campaign_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn maybe_complete_campaign_for_contact(&self, contact_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT campaign_id FROM campaign_contacts WHERE id = ?")
            .bind(contact_id)
            .fetch_one(&self.pool)
            .await?;
        let campaign_id: i64 = row.get("campaign_id");

        let remaining = sqlx::query(
            "SELECT COUNT(*) as n FROM campaign_contacts WHERE campaign_id = ? AND state IN ('pending', 'dialing')",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("n");

        if remaining == 0 {
            self.set_campaign_state(campaign_id, CampaignState::Completed).await?;
        }
        Ok(())
    }
}

fn row_to_campaign(r: sqlx::sqlite::SqliteRow) -> Campaign {
    Campaign {
        id: r.get("id"),
        name: r.get("name"),
        project_id: r.get("project_id"),
        state: CampaignState::from_str(&r.get::<String, _>("state")).unwrap_or(CampaignState::Draft),
        total: r.get("total"),
        processed: r.get("processed"),
        succeeded: r.get("succeeded"),
        failed: r.get("failed"),
    }
}

fn row_to_contact(r: sqlx::sqlite::SqliteRow) -> Contact {
    let extra: HashMap<String, String> =
        serde_json::from_str(&r.get::<String, _>("extra")).unwrap_or_default();
    Contact {
        id: r.get("id"),
        campaign_id: r.get("campaign_id"),
        phone: r.get("phone"),
        extra,
        state: ContactState::from_str(&r.get::<String, _>("state")).unwrap_or(ContactState::Pending),
        attempts: r.get::<i64, _>("attempts") as i32,
        last_attempt: r
            .get::<Option<String>, _>("last_attempt")
            .and_then(|s| s.parse().ok()),
        result: r.get("result"),
    }
}
