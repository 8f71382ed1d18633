//! Orphan Reaper: reconciles `call_log` rows that the event handler never
//! closed out, against the in-memory tracker.

use std::sync::Arc;
use std::time::Duration;

use apicall_switch_core::{Fields, SwitchClient};
use chrono::Utc;
use tracing::{info, warn};

use crate::db::DatabaseManager;
use crate::error::Result;
use crate::models::CallStatus;
use crate::tracker::ActiveCallTracker;

pub struct OrphanReaper {
    db: Arc<DatabaseManager>,
    tracker: Arc<ActiveCallTracker>,
    switch: SwitchClient,
    tick: Duration,
    horizon: chrono::Duration,
    hard_ceiling: chrono::Duration,
}

impl OrphanReaper {
    pub fn new(
        db: Arc<DatabaseManager>,
        tracker: Arc<ActiveCallTracker>,
        switch: SwitchClient,
        tick: Duration,
        horizon_secs: i64,
        hard_ceiling_secs: i64,
    ) -> Self {
        Self {
            db,
            tracker,
            switch,
            tick,
            horizon: chrono::Duration::seconds(horizon_secs),
            hard_ceiling: chrono::Duration::seconds(hard_ceiling_secs),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "orphan reap failed");
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - self.horizon;
        let rows = self.db.dialing_older_than(cutoff).await?;
        for row in rows {
            self.reconcile(row).await?;
        }
        Ok(())
    }

    async fn reconcile(&self, row: crate::models::CallLog) -> Result<()> {
        let in_flight = row
            .unique_id
            .as_deref()
            .and_then(|uid| self.tracker.get_by_unique_id(uid));

        let age = Utc::now() - row.created_at;

        match in_flight {
            None => {
                // No in-memory record at all: the process likely restarted,
                // or the event handler never saw a matching channel. Mark
                // it orphaned and free the contact for another attempt.
                let applied = self
                    .db
                    .finalize_call_log(row.id, CallStatus::Orphan, None, false, None, None)
                    .await?;
                if applied {
                    info!(call_log_id = row.id, "marked orphaned call_log row");
                }
                if let Some(contact_id) = row.contact_id {
                    // No retry-count bump here: an orphan is not a dial
                    // failure we observed, just one we can no longer
                    // account for. Give it back for the next sweep.
                    self.db.revert_contact_to_pending(contact_id).await?;
                }
            }
            Some(call) if age > self.hard_ceiling => {
                // Still tracked but stuck well past a sane call length:
                // force the switch to hang it up and let the event
                // handler's normal terminal path finish the job.
                warn!(correlation_id = %call.correlation_id, "forcing hangup of stale in-flight call");
                let mut fields = Fields::new();
                if let Some(channel) = &call.channel_name {
                    fields.push("Channel", channel);
                }
                self.switch.send("Hangup", fields).await.ok();
            }
            Some(_) => {
                // Tracked and within the hard ceiling; leave it for the
                // event handler to finish normally.
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizon_and_ceiling_convert_from_seconds() {
        let horizon = chrono::Duration::seconds(600);
        let ceiling = chrono::Duration::seconds(3600);
        assert!(ceiling > horizon);
    }
}
