//! End-to-end coverage of the admission, originate, IVR, and orphan
//! reconciliation paths, driven against a scripted fake switch instead of a
//! real one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apicall_dispatch_engine::db::DatabaseManager;
use apicall_dispatch_engine::event_handler::EventHandler;
use apicall_dispatch_engine::ivr::IvrSessionHandler;
use apicall_dispatch_engine::models::{Campaign, CampaignState, CallState, CallStatus, Project, Trunk};
use apicall_dispatch_engine::originator::{DialRequest, Originator};
use apicall_dispatch_engine::pool::ChannelPool;
use apicall_dispatch_engine::reaper::OrphanReaper;
use apicall_dispatch_engine::tracker::ActiveCallTracker;
use apicall_switch_core::{
    accept_agi_session, AgiConnection, AgiRequest, BoxTransport, ClientConfig, ConnectFuture, Connector, Fields,
    SwitchClient,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Hands the client its end of an in-memory duplex stream exactly once.
struct SingleUseConnector {
    conn: AsyncMutex<Option<DuplexStream>>,
}

impl SingleUseConnector {
    fn new(stream: DuplexStream) -> Self {
        Self {
            conn: AsyncMutex::new(Some(stream)),
        }
    }
}

impl Connector for SingleUseConnector {
    fn connect(&self) -> ConnectFuture {
        let taken = self.conn.try_lock().ok().and_then(|mut g| g.take());
        Box::pin(async move {
            match taken {
                Some(s) => Ok(Box::new(s) as BoxTransport),
                None => Err(std::io::Error::new(std::io::ErrorKind::Other, "exhausted")),
            }
        })
    }

    fn login_fields(&self) -> Fields {
        let mut f = Fields::new();
        f.push("Username", "test");
        f
    }
}

/// Drives the server side of the duplex pair: replies `Success` to every
/// action (plus whatever extra fields `script` names for that action), and
/// forwards anything sent on the returned channel as a raw event block.
fn spawn_fake_switch(server: DuplexStream, script: HashMap<String, Vec<(String, String)>>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (read_half, write_half) = tokio::io::split(server);
    let write_half = Arc::new(AsyncMutex::new(write_half));

    let reply_write = write_half.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut block = String::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if line.trim().is_empty() {
                if !block.is_empty() {
                    let action_name = block.lines().find_map(|l| l.strip_prefix("Action: "));
                    let action_id = block.lines().find_map(|l| l.strip_prefix("ActionID: "));
                    if let Some(action_id) = action_id {
                        let mut reply = format!("Response: Success\nActionID: {action_id}\n");
                        if let Some(extra) = action_name.and_then(|n| script.get(n)) {
                            for (k, v) in extra {
                                reply.push_str(&format!("{k}: {v}\n"));
                            }
                        }
                        reply.push('\n');
                        let mut w = reply_write.lock().await;
                        let _ = w.write_all(reply.as_bytes()).await;
                    }
                    block.clear();
                }
            } else {
                block.push_str(&line);
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut w = write_half.lock().await;
            let _ = w.write_all(frame.as_bytes()).await;
        }
    });

    tx
}

fn send_event(tx: &mpsc::UnboundedSender<String>, name: &str, fields: &[(&str, &str)]) {
    let mut s = format!("Event: {name}\n");
    for (k, v) in fields {
        s.push_str(&format!("{k}: {v}\n"));
    }
    s.push('\n');
    tx.send(s).unwrap();
}

/// Simulates the switch opening its per-call control channel connection:
/// sends the environment, then answers `STREAM FILE`/`WAIT FOR DIGIT`/
/// `HANGUP` the way a real switch would, handing back `digit` (an AGI
/// numeric digit code, e.g. `"49"` for `'1'`) only from the wait step.
async fn fake_agi_session(correlation_id: &str, digit: Option<&str>) -> (AgiRequest, AgiConnection<BoxTransport>) {
    let (switch_side, handler_side) = tokio::io::duplex(8192);
    let corr = correlation_id.to_string();
    let digit = digit.map(str::to_string);
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(switch_side);
        let mut reader = BufReader::new(read_half);
        let env = format!("agi_channel: SIP/test-001\nagi_uniqueid: u-1\nagi_corr_id: {corr}\n\n");
        let _ = write_half.write_all(env.as_bytes()).await;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim();
            let reply = if line.starts_with("STREAM FILE") {
                "200 result=0\n".to_string()
            } else if line.starts_with("WAIT FOR DIGIT") {
                format!("200 result={}\n", digit.as_deref().unwrap_or("0"))
            } else {
                "200 result=1\n".to_string()
            };
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            if line.starts_with("HANGUP") {
                return;
            }
        }
    });

    let transport: BoxTransport = Box::new(handler_side);
    accept_agi_session(transport).await.unwrap()
}

async fn wait_for_connection(switch: &SwitchClient) {
    for _ in 0..50 {
        if switch.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("switch never connected");
}

fn sample_project() -> Project {
    Project {
        id: 0,
        name: "demo".to_string(),
        caller_id: "1000000000".to_string(),
        prompt_audio: "welcome.wav".to_string(),
        prompt_duration_secs: 4,
        expected_digit: '1',
        transfer_destination: "200".to_string(),
        preferred_trunk: None,
        dial_prefix: "apicall-ivr".to_string(),
        authorized_ips: Vec::new(),
        max_retries: 3,
        retry_backoff_secs: 60,
        amd_enabled: false,
        smart_cid_enabled: false,
    }
}

fn sample_trunk(name: &str) -> Trunk {
    Trunk {
        id: 0,
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 5060,
        username: String::new(),
        secret: String::new(),
        context: "apicall-ivr".to_string(),
        caller_id_override: None,
        active: true,
        max_channels: 30,
    }
}

struct Harness {
    db: Arc<DatabaseManager>,
    pool: Arc<ChannelPool>,
    tracker: Arc<ActiveCallTracker>,
    switch: SwitchClient,
    events: mpsc::UnboundedSender<String>,
    project_id: i64,
}

async fn harness(trunk_name: &str, global_max: u32, trunk_capacity: u32, script: HashMap<String, Vec<(String, String)>>) -> Harness {
    let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
    let project_id = db.insert_project(&sample_project()).await.unwrap();
    let trunk_id = db.insert_trunk(&sample_trunk(trunk_name)).await.unwrap();
    db.link_project_trunk(project_id, trunk_id).await.unwrap();

    let pool = Arc::new(ChannelPool::new(global_max, 100));
    pool.register_trunk(trunk_name, trunk_capacity);
    let tracker = Arc::new(ActiveCallTracker::new());

    let (client_side, server_side) = tokio::io::duplex(8192);
    let connector = Arc::new(SingleUseConnector::new(client_side));
    let switch = SwitchClient::spawn(connector, ClientConfig::default());
    let events = spawn_fake_switch(server_side, script);
    wait_for_connection(&switch).await;

    Harness {
        db,
        pool,
        tracker,
        switch,
        events,
        project_id,
    }
}

async fn wait_until<F: Fn() -> bool>(predicate: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// Scenario A (happy path): admitted call rings, answers, matches the
// expected digit, transfers, and hangs up as TRANSFER.
#[tokio::test]
async fn happy_path_transfers_on_matching_digit() {
    let h = harness("trunk-a", 5, 5, HashMap::new()).await;

    let ivr = Arc::new(IvrSessionHandler::new(h.db.clone(), h.tracker.clone(), h.switch.clone(), Duration::from_secs(2)));
    let event_handler = Arc::new(EventHandler::new(h.db.clone(), h.tracker.clone(), h.switch.clone()));
    tokio::spawn(event_handler.clone().run());

    let originator = Originator::new(h.db.clone(), h.pool.clone(), h.tracker.clone(), h.switch.clone(), "apicall-ivr");
    let admitted = originator
        .dial(DialRequest {
            project_id: h.project_id,
            phone: "3000000001".to_string(),
            campaign_id: None,
            contact_id: None,
        })
        .await
        .unwrap();

    send_event(&h.events, "ChannelCreated", &[("corr_id", &admitted.correlation_id), ("Channel", "SIP/trunk-a-001"), ("Uniqueid", "u-1")]);
    send_event(&h.events, "Newstate", &[("corr_id", &admitted.correlation_id), ("ChannelStateDesc", "Up")]);

    let tracker = h.tracker.clone();
    let corr = admitted.correlation_id.clone();
    wait_until(
        || tracker.get(&corr).map(|c| c.state == CallState::Answered).unwrap_or(false),
        "the call to reach Answered",
    )
    .await;

    // The switch opens its per-call control channel connection once the
    // channel is up; the control channel server would hand this off to
    // the IVR session handler the same way.
    let (request, conn) = fake_agi_session(&admitted.correlation_id, Some("49")).await;
    ivr.run_session(&admitted.correlation_id, request, conn).await.unwrap();

    assert_eq!(
        h.tracker.get(&admitted.correlation_id).map(|c| c.state),
        Some(CallState::Transferring)
    );

    send_event(&h.events, "Hangup", &[("corr_id", &admitted.correlation_id), ("Cause", "16")]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let log = h.db.get_call_log(admitted.call_log_id).await.unwrap().unwrap();
        if log.status.is_some() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for the call_log row to finalize");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let log = h.db.get_call_log(admitted.call_log_id).await.unwrap().unwrap();
    assert_eq!(log.status, Some(CallStatus::Transfer));
    assert!(!h.tracker.contains(&admitted.correlation_id));
    assert_eq!(h.pool.global_free(), 5);
}

// Scenario B: no digit pressed within the collection window.
#[tokio::test]
async fn no_digit_marks_call_as_no_dtmf() {
    let h = harness("trunk-b", 5, 5, HashMap::new()).await;

    let originator = Originator::new(h.db.clone(), h.pool.clone(), h.tracker.clone(), h.switch.clone(), "apicall-ivr");
    let admitted = originator
        .dial(DialRequest {
            project_id: h.project_id,
            phone: "3000000002".to_string(),
            campaign_id: None,
            contact_id: None,
        })
        .await
        .unwrap();
    h.tracker.update(&admitted.correlation_id, |c| c.state = CallState::Answered);

    let ivr = IvrSessionHandler::new(h.db.clone(), h.tracker.clone(), h.switch.clone(), Duration::from_secs(2));
    let (request, conn) = fake_agi_session(&admitted.correlation_id, None).await;
    ivr.run_session(&admitted.correlation_id, request, conn).await.unwrap();

    let log = h.db.get_call_log(admitted.call_log_id).await.unwrap().unwrap();
    assert_eq!(log.status, Some(CallStatus::NoDtmf));
    assert!(!h.tracker.contains(&admitted.correlation_id));
}

// Scenario C: a digit is pressed but it doesn't match the project's
// expected digit — still an interacted answer, not a transfer.
#[tokio::test]
async fn wrong_digit_marks_call_answered_not_transferred() {
    let h = harness("trunk-c", 5, 5, HashMap::new()).await;

    let originator = Originator::new(h.db.clone(), h.pool.clone(), h.tracker.clone(), h.switch.clone(), "apicall-ivr");
    let admitted = originator
        .dial(DialRequest {
            project_id: h.project_id,
            phone: "3000000003".to_string(),
            campaign_id: None,
            contact_id: None,
        })
        .await
        .unwrap();
    h.tracker.update(&admitted.correlation_id, |c| c.state = CallState::Answered);

    let ivr = IvrSessionHandler::new(h.db.clone(), h.tracker.clone(), h.switch.clone(), Duration::from_secs(2));
    let (request, conn) = fake_agi_session(&admitted.correlation_id, Some("57")).await;
    ivr.run_session(&admitted.correlation_id, request, conn).await.unwrap();

    let log = h.db.get_call_log(admitted.call_log_id).await.unwrap().unwrap();
    assert_eq!(log.status, Some(CallStatus::Answer));
    assert_eq!(log.dtmf.as_deref(), Some("9"));
    assert!(log.interacted);
}

// Scenario D: a trunk at capacity rejects a second admission even though
// the global pool still has room.
#[tokio::test]
async fn busy_trunk_rejects_second_admission() {
    let h = harness("trunk-d", 5, 1, HashMap::new()).await;
    let originator = Originator::new(h.db.clone(), h.pool.clone(), h.tracker.clone(), h.switch.clone(), "apicall-ivr");

    let first = originator
        .dial(DialRequest {
            project_id: h.project_id,
            phone: "3000000004".to_string(),
            campaign_id: None,
            contact_id: None,
        })
        .await
        .unwrap();
    assert_eq!(h.pool.trunk_free("trunk-d"), 0);

    let second = originator
        .dial(DialRequest {
            project_id: h.project_id,
            phone: "3000000005".to_string(),
            campaign_id: None,
            contact_id: None,
        })
        .await;
    match second {
        Err(e) => assert!(e.is_retryable()),
        Ok(_) => panic!("expected the second dial to be rejected"),
    }

    // The rejected attempt never touched the pool's counters.
    assert_eq!(h.pool.trunk_free("trunk-d"), 0);
    assert!(first.call_log_id > 0);
}

// Scenario E: a dialing row with no matching in-memory record (simulating
// a process restart) is marked orphaned and its contact is freed for retry.
#[tokio::test]
async fn orphan_reaper_reconciles_untracked_dialing_rows() {
    let h = harness("trunk-e", 5, 5, HashMap::new()).await;

    let campaign_id = h
        .db
        .insert_campaign(&Campaign {
            id: 0,
            name: "reap-me".to_string(),
            project_id: h.project_id,
            state: CampaignState::Active,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
        })
        .await
        .unwrap();
    let contact_id = h.db.insert_contact(campaign_id, "3000000006", &HashMap::new()).await.unwrap();
    let claimed = h.db.claim_pending_contacts(campaign_id, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let call_log_id = h
        .db
        .insert_call_log_dialing(h.project_id, "3000000006", Some(campaign_id), Some(contact_id), "1000000000")
        .await
        .unwrap();

    let reaper = Arc::new(OrphanReaper::new(h.db.clone(), h.tracker.clone(), h.switch.clone(), Duration::from_millis(20), 0, 3600));
    let _ = tokio::time::timeout(Duration::from_millis(200), reaper.run()).await;

    let log = h.db.get_call_log(call_log_id).await.unwrap().unwrap();
    assert_eq!(log.status, Some(CallStatus::Orphan));

    let reclaimed = h.db.claim_pending_contacts(campaign_id, 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, contact_id);
}
