//! Campaign Sweeper: periodic intake of pending contacts into the dial
//! pipeline, gated by per-campaign schedule windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::db::DatabaseManager;
use crate::error::Result;
use crate::models::{Campaign, Schedule};
use crate::originator::{DialRequest, Originator};
use crate::pool::ChannelPool;

pub struct CampaignSweeper {
    db: Arc<DatabaseManager>,
    pool: Arc<ChannelPool>,
    originator: Arc<Originator>,
    tick: Duration,
    batch_cap: u32,
}

impl CampaignSweeper {
    pub fn new(
        db: Arc<DatabaseManager>,
        pool: Arc<ChannelPool>,
        originator: Arc<Originator>,
        tick: Duration,
        batch_cap: u32,
    ) -> Self {
        Self {
            db,
            pool,
            originator,
            tick,
            batch_cap,
        }
    }

    /// Runs forever, ticking at the configured interval. Intended to be
    /// spawned as a long-lived background task by the engine.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "campaign sweep failed");
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let campaigns = self.db.get_active_campaigns().await?;
        for campaign in campaigns {
            if let Err(e) = self.sweep_campaign(&campaign).await {
                warn!(campaign_id = campaign.id, error = %e, "sweeping campaign failed");
            }
        }
        Ok(())
    }

    async fn sweep_campaign(&self, campaign: &Campaign) -> Result<()> {
        let schedules = self.db.get_schedules(campaign.id).await?;
        if !schedules.is_empty() && !within_any_window(&schedules, Utc::now()) {
            debug!(campaign_id = campaign.id, "outside schedule window, skipping");
            return Ok(());
        }

        let trunks = self.db.get_trunks_for_project(campaign.project_id).await?;
        let per_trunk_free: u32 = trunks.iter().map(|t| self.pool.trunk_free(&t.name)).sum();
        let intake = self
            .pool
            .global_free()
            .min(per_trunk_free)
            .min(self.batch_cap);
        if intake == 0 {
            return Ok(());
        }

        let contacts = self.db.claim_pending_contacts(campaign.id, intake).await?;
        if contacts.is_empty() {
            return Ok(());
        }
        info!(campaign_id = campaign.id, claimed = contacts.len(), "sweeper claimed contacts");

        for contact in contacts {
            let req = DialRequest {
                project_id: campaign.project_id,
                phone: contact.phone.clone(),
                campaign_id: Some(campaign.id),
                contact_id: Some(contact.id),
            };
            match self.originator.dial(req).await {
                Ok(admitted) => {
                    debug!(contact_id = contact.id, correlation_id = %admitted.correlation_id, "contact dialed");
                }
                Err(e) if e.is_retryable() => {
                    // Admission rejected or the switch/database hiccuped —
                    // give the contact back for the next tick without
                    // counting it as a failed attempt.
                    warn!(contact_id = contact.id, error = %e, "admission rejected, reverting to pending");
                    self.db.revert_contact_to_pending(contact.id).await?;
                }
                Err(e) => {
                    warn!(contact_id = contact.id, error = %e, "originate failed, bumping attempts");
                    let project = self.db.get_project(campaign.project_id).await?;
                    let max_retries = project.map(|p| p.max_retries).unwrap_or(0);
                    self.db
                        .fail_contact_attempt(contact.id, max_retries, &e.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// True if `now` (in the system's local timezone) falls within any active
/// schedule window for the campaign.
fn within_any_window(schedules: &[Schedule], now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&chrono::Local);
    let day = local.weekday().num_days_from_sunday() as u8;
    let time = local.time();
    schedules
        .iter()
        .filter(|s| s.active && s.day_of_week == day)
        .any(|s| time >= s.start && time <= s.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn schedule(day: u8, start: &str, end: &str) -> Schedule {
        Schedule {
            campaign_id: 1,
            day_of_week: day,
            start: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
            active: true,
        }
    }

    #[test]
    fn within_window_respects_day_and_time() {
        // Wednesday 2024-01-03, 10:00 local.
        let now = chrono::Local
            .with_ymd_and_hms(2024, 1, 3, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let schedules = vec![schedule(3, "09:00", "17:00")];
        assert!(within_any_window(&schedules, now));

        let schedules = vec![schedule(3, "18:00", "20:00")];
        assert!(!within_any_window(&schedules, now));
    }
}
