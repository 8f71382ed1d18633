//! Call state machine driven by switch events.
//!
//! Subscribes once to the switch's event stream and fans transitions out
//! per correlation id through a small in-process router, so events for one
//! call are processed strictly in order while different calls progress
//! concurrently.

use std::sync::Arc;

use apicall_switch_core::{SwitchClient, SwitchEvent};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::DatabaseManager;
use crate::models::{status_from_hangup_cause, CallState, CallStatus};
use crate::smartcid::{SmartCidGenerator, SMART_CID_PREFIX_LEN};
use crate::tracker::ActiveCallTracker;

pub struct EventHandler {
    db: Arc<DatabaseManager>,
    tracker: Arc<ActiveCallTracker>,
    switch: SwitchClient,
    /// Per-correlation-id mailbox, so concurrent events for the same call
    /// queue behind one another instead of racing a shared mutable record.
    lanes: Arc<DashMap<String, mpsc::UnboundedSender<SwitchEvent>>>,
}

impl EventHandler {
    pub fn new(db: Arc<DatabaseManager>, tracker: Arc<ActiveCallTracker>, switch: SwitchClient) -> Self {
        Self {
            db,
            tracker,
            switch,
            lanes: Arc::new(DashMap::new()),
        }
    }

    /// Runs until the switch event stream closes. Intended to be spawned
    /// as a long-lived background task by the engine.
    pub async fn run(self: Arc<Self>) {
        let mut sub = self.switch.subscribe(|e| {
            matches!(
                e.name.as_str(),
                "ChannelCreated" | "Newstate" | "VarSet" | "OriginateResponse" | "Hangup"
            )
        });
        info!("event handler subscribed to switch events");
        while let Some(event) = sub.next().await {
            self.route(event);
        }
        warn!("switch event stream closed, event handler stopping");
    }

    /// Dispatches `event` to the lane for its correlation id, spawning a
    /// fresh per-call worker the first time one is seen.
    fn route(&self, event: SwitchEvent) {
        let Some(correlation_id) = correlation_id_of(&event) else {
            debug!(event = %event.name, "event carries no correlation id, dropping");
            return;
        };

        if let Some(tx) = self.lanes.get(&correlation_id) {
            let _ = tx.send(event);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        self.lanes.insert(correlation_id.clone(), tx);

        let db = self.db.clone();
        let tracker = self.tracker.clone();
        let lanes = self.lanes.clone();
        tokio::spawn(async move {
            run_lane(db, tracker, rx).await;
            // The call reached a terminal state (or the stream closed);
            // drop the lane so a reused correlation id starts fresh.
            lanes.remove(&correlation_id);
        });
    }
}

fn correlation_id_of(event: &SwitchEvent) -> Option<String> {
    event.get("corr_id").map(str::to_string)
}

async fn run_lane(
    db: Arc<DatabaseManager>,
    tracker: Arc<ActiveCallTracker>,
    mut rx: mpsc::UnboundedReceiver<SwitchEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(correlation_id) = correlation_id_of(&event) else {
            continue;
        };
        if let Err(e) = handle_event(&db, &tracker, &correlation_id, &event).await {
            warn!(correlation_id = %correlation_id, error = %e, "event handler step failed");
        }
        if !tracker.contains(&correlation_id) {
            // Terminal transition already removed the record; nothing more
            // to do for this lane.
            break;
        }
    }
}

async fn handle_event(
    db: &DatabaseManager,
    tracker: &ActiveCallTracker,
    correlation_id: &str,
    event: &SwitchEvent,
) -> crate::error::Result<()> {
    match event.name.as_str() {
        "ChannelCreated" => {
            if let Some(channel) = event.get("Channel") {
                tracker.update(correlation_id, |c| {
                    c.channel_name = Some(channel.to_string());
                    c.state = CallState::Ringing;
                });
            }
            if let Some(unique_id) = event.get("Uniqueid") {
                tracker.attach_unique_id(correlation_id, unique_id);
            }
        }
        "Newstate" => {
            if event.get("ChannelStateDesc") == Some("Up") {
                let now = Utc::now();
                tracker.update(correlation_id, |c| {
                    c.state = CallState::Answered;
                    c.answered_at = Some(now);
                });
                // The IVR session itself starts when the switch opens its
                // per-call control channel connection to us, handled by
                // the control channel server; this just marks the call
                // answered for the tracker and call log.
            }
        }
        "VarSet" => {
            // Answering-machine-detection verdicts surface as a channel
            // variable ahead of the IVR session starting; stash it on the
            // tracker record so the session handler can read it without
            // a control-channel round trip.
            if event.get("Variable") == Some("AMDSTATUS") {
                let verdict = event.get("Value").map(str::to_string);
                debug!(correlation_id, verdict = ?verdict, "amd verdict observed");
                tracker.update(correlation_id, |c| {
                    c.amd_verdict = verdict;
                });
            }
        }
        "OriginateResponse" => {
            // Asynchronous confirmation of the synchronous Originate send;
            // failures here race with the synchronous failure path in the
            // originator and are handled identically via finalize_call_log's
            // conditional update.
            if event.get("Response") == Some("Failure") {
                terminate(db, tracker, correlation_id, CallStatus::Failed, None, false, None).await?;
            }
        }
        "Hangup" => {
            let call = tracker.get(correlation_id);
            let Some(call) = call else {
                return Ok(());
            };
            let cause: u32 = event.get("Cause").and_then(|c| c.parse().ok()).unwrap_or(0);
            let was_answered = call.answered_at.is_some();
            // TRANSFER is set by the IVR handler's own completion path, not
            // inferred from a bare hangup cause; every other exit falls
            // back to the cause-code table.
            let status = if call.state == CallState::Transferring {
                CallStatus::Transfer
            } else {
                status_from_hangup_cause(cause, was_answered)
            };
            let dtmf = event.get("DTMF").map(str::to_string);
            terminate(
                db,
                tracker,
                correlation_id,
                status,
                dtmf.as_deref(),
                dtmf.is_some() || matches!(status, CallStatus::Answer),
                call.unique_id.as_deref(),
            )
            .await?;
        }
        other => {
            debug!(event = other, "unhandled switch event");
        }
    }
    Ok(())
}

/// Shared terminal-transition path for every exit edge of the state
/// machine: finalize the log row, drop the tracker record (releasing the
/// admission slot via `Arc<Slot>`'s `Drop`), and, for campaign-originated
/// calls, hand off to the sweeper's contact-completion logic.
pub async fn terminate(
    db: &DatabaseManager,
    tracker: &ActiveCallTracker,
    correlation_id: &str,
    status: CallStatus,
    dtmf: Option<&str>,
    interacted: bool,
    unique_id: Option<&str>,
) -> crate::error::Result<()> {
    let Some(call) = tracker.remove(correlation_id) else {
        return Ok(());
    };
    if matches!(status, CallStatus::Answer | CallStatus::Transfer) {
        let generator = SmartCidGenerator::new(db, SMART_CID_PREFIX_LEN);
        if let Err(e) = generator.record_answer(&call.phone, &call.caller_id).await {
            warn!(correlation_id, error = %e, "failed to record smart-cid answer");
        }
    }
    let duration = call.answered_at.map(|at| (Utc::now() - at).num_seconds());
    let applied = db
        .finalize_call_log(call.call_log_id, status, dtmf, interacted, duration, unique_id)
        .await?;
    if !applied {
        debug!(correlation_id, "call_log already finalized, skipping");
    }
    if let Some(contact_id) = call.contact_id {
        if status.is_contact_success() {
            db.complete_contact(contact_id, true, status.as_str()).await?;
        } else {
            // fail_contact_attempt bumps the attempt counter and decides
            // pending vs. failed against the project's max retries; the
            // sweeper's next tick picks pending contacts back up.
            let project = db.get_project(call.project_id).await?;
            let max_retries = project.map(|p| p.max_retries).unwrap_or(0);
            db.fail_contact_attempt(contact_id, max_retries, status.as_str()).await?;
        }
    }
    info!(correlation_id, status = status.as_str(), "call terminated");
    Ok(())
}
