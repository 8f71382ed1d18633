//! IVR session handler: prompt playback, DTMF collection, and the
//! transfer/no-digit branches of the call state machine.
//!
//! Driven by the per-call control channel server (`control.rs`), which
//! hands over one [`AgiConnection`] per answered channel after reading
//! its environment.

use std::time::Duration;

use apicall_switch_core::{AgiConnection, AgiRequest, BoxTransport, Fields, SwitchClient};
use tracing::{info, warn};

use crate::db::DatabaseManager;
use crate::error::Result;
use crate::event_handler::terminate;
use crate::models::{CallState, CallStatus};
use crate::tracker::ActiveCallTracker;

pub struct IvrSessionHandler {
    db: std::sync::Arc<DatabaseManager>,
    tracker: std::sync::Arc<ActiveCallTracker>,
    switch: SwitchClient,
    digit_grace: Duration,
}

impl IvrSessionHandler {
    pub fn new(
        db: std::sync::Arc<DatabaseManager>,
        tracker: std::sync::Arc<ActiveCallTracker>,
        switch: SwitchClient,
        digit_grace: Duration,
    ) -> Self {
        Self {
            db,
            tracker,
            switch,
            digit_grace,
        }
    }

    /// Drives one answered call through its IVR session over `conn`.
    /// Invoked by the control channel server once it has read the
    /// connecting channel's environment.
    pub async fn run_session(
        &self,
        correlation_id: &str,
        request: AgiRequest,
        mut conn: AgiConnection<BoxTransport>,
    ) -> Result<()> {
        let Some(call) = self.tracker.get(correlation_id) else {
            return Ok(());
        };
        let Some(project) = self.db.get_project(call.project_id).await? else {
            return Ok(());
        };

        self.tracker.update(correlation_id, |c| c.state = CallState::Ivr);
        if let Some(unique_id) = request.get("agi_uniqueid") {
            self.tracker.attach_unique_id(correlation_id, unique_id);
        }

        // 2. AMD verdict, if the project opted in, was already observed
        // off the switch's AMDSTATUS channel variable and stashed on the
        // tracker record by the event handler before this session started.
        if project.amd_enabled && call.amd_verdict.as_deref() == Some("MACHINE") {
            info!(correlation_id, "amd verdict MACHINE, ending session");
            terminate(&self.db, &self.tracker, correlation_id, CallStatus::NoDtmf, None, false, call.unique_id.as_deref())
                .await?;
            conn.hangup().await.ok();
            return Ok(());
        }

        // 3. play the prompt and collect a single digit, bounded by the
        // prompt's own length plus a fixed grace period.
        let wait_ms = (Duration::from_secs(project.prompt_duration_secs.max(0) as u64) + self.digit_grace).as_millis() as u64;
        let digit = match self.collect_digit(&mut conn, &project.prompt_audio, wait_ms).await {
            Ok(d) => d,
            Err(e) => {
                warn!(correlation_id, error = %e, "dtmf collection failed");
                None
            }
        };

        match digit {
            Some(d) if d == project.expected_digit => {
                // 4. expected digit: bridge to the transfer destination.
                self.tracker.update(correlation_id, |c| c.state = CallState::Transferring);
                let mut fields = Fields::new();
                if let Some(channel) = &call.channel_name {
                    fields.push("Channel", channel);
                }
                fields.push("Exten", &project.transfer_destination);
                fields.push("Context", &project.dial_prefix);
                fields.push("Priority", "1");
                self.switch.send("Bridge", fields).await?;
                info!(correlation_id, "transferring call to overflow destination");
            }
            Some(d) => {
                // 5. wrong digit pressed: counts as an interacted answer.
                terminate(
                    &self.db,
                    &self.tracker,
                    correlation_id,
                    CallStatus::Answer,
                    Some(&d.to_string()),
                    true,
                    call.unique_id.as_deref(),
                )
                .await?;
                conn.hangup().await.ok();
            }
            None => {
                // 5. no digit pressed within the window.
                terminate(&self.db, &self.tracker, correlation_id, CallStatus::NoDtmf, None, false, call.unique_id.as_deref())
                    .await?;
                conn.hangup().await.ok();
            }
        }

        Ok(())
    }

    /// Plays `prompt`, taking any digit pressed during playback, then
    /// falls back to a bounded wait for one pressed afterward.
    async fn collect_digit(
        &self,
        conn: &mut AgiConnection<BoxTransport>,
        prompt: &str,
        wait_ms: u64,
    ) -> Result<Option<char>> {
        let played = conn.stream_file(prompt, "0123456789").await?;
        let during_playback: i64 = played.value.parse().unwrap_or(0);
        if during_playback > 0 {
            return Ok(char::from_u32(during_playback as u32));
        }
        Ok(conn.wait_for_digit(wait_ms).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_window_adds_prompt_duration_and_grace() {
        let grace = Duration::from_secs(3);
        let prompt_duration = Duration::from_secs(8);
        let wait_ms = (prompt_duration + grace).as_millis() as u64;
        assert_eq!(wait_ms, 11_000);
    }
}
