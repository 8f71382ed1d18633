//! Persistent, reconnecting client for the switch's management channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SwitchError};
use crate::proto::{parse_block, Action, Fields, Frame, Response, SwitchEvent};

/// Anything the client can speak the line protocol over.
pub trait SwitchTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SwitchTransport for T {}

pub type BoxTransport = Box<dyn SwitchTransport>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<BoxTransport>> + Send>>;

/// Opens a fresh transport and performs login. Implemented once for the
/// real TCP+credentials path; tests supply a fake that hands back an
/// in-memory duplex stream.
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture;
    /// Fields sent as the first `Action: Login` request after connecting.
    fn login_fields(&self) -> Fields;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bounded per-subscriber broadcast capacity; a lagging subscriber
    /// drops its oldest unread events rather than stalling the reader.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Response>>>,
    events: broadcast::Sender<SwitchEvent>,
    writer: AsyncMutex<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    action_id_seq: AtomicU64,
}

/// A persistent, auto-reconnecting client for the switch management channel.
#[derive(Clone)]
pub struct SwitchClient {
    shared: Arc<Shared>,
}

impl SwitchClient {
    /// Connects in the background and returns immediately; `send`/`subscribe`
    /// work from the first successful connection onward.
    pub fn spawn(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_buffer);
        let shared = Arc::new(Shared {
            connector,
            config,
            pending: AsyncMutex::new(HashMap::new()),
            events: events_tx,
            writer: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
            action_id_seq: AtomicU64::new(1),
        });
        let client = Self {
            shared: shared.clone(),
        };
        tokio::spawn(connection_loop(shared));
        client
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn next_action_id(&self) -> String {
        let n = self.shared.action_id_seq.fetch_add(1, Ordering::Relaxed);
        format!("{n}-{}", Uuid::new_v4().simple())
    }

    /// Mints a fresh `ActionID`, parks a response waiter, writes the action,
    /// and waits for the correlated response or a bounded timeout.
    pub async fn send(&self, name: &str, fields: Fields) -> Result<Response> {
        if !self.is_connected() {
            return Err(SwitchError::Disconnected);
        }
        let action_id = self.next_action_id();
        let mut action = Action::new(name, action_id.clone());
        action.fields = fields;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.insert(action_id.clone(), tx);
        }

        let writer = {
            let guard = self.shared.writer.lock().await;
            guard.clone()
        };
        let Some(writer) = writer else {
            self.shared.pending.lock().await.remove(&action_id);
            return Err(SwitchError::Disconnected);
        };
        if writer.send(action.encode()).is_err() {
            self.shared.pending.lock().await.remove(&action_id);
            return Err(SwitchError::Disconnected);
        }

        match timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(resp)) => {
                if resp.is_success() {
                    Ok(resp)
                } else {
                    Err(SwitchError::Rejected(
                        resp.fields.get("Message").unwrap_or(&resp.status).to_string(),
                    ))
                }
            }
            Ok(Err(_)) => Err(SwitchError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&action_id);
                Err(SwitchError::Timeout(self.shared.config.request_timeout))
            }
        }
    }

    /// Returns a filtered event stream. Fan-out: every subscriber sees every
    /// matching event in on-wire order; a subscriber that falls behind loses
    /// its oldest unread events (logged) instead of blocking delivery to
    /// anyone else.
    pub fn subscribe(
        &self,
        predicate: impl Fn(&SwitchEvent) -> bool + Send + Sync + 'static,
    ) -> EventSubscription {
        EventSubscription {
            rx: self.shared.events.subscribe(),
            predicate: Arc::new(predicate),
        }
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<SwitchEvent>,
    predicate: Arc<dyn Fn(&SwitchEvent) -> bool + Send + Sync>,
}

impl EventSubscription {
    /// Awaits the next event matching this subscription's predicate.
    pub async fn next(&mut self) -> Option<SwitchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event subscriber stalled, dropped oldest events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

async fn connection_loop(shared: Arc<Shared>) {
    let mut backoff = shared.config.initial_backoff;
    loop {
        match shared.connector.connect().await {
            Ok(transport) => {
                backoff = shared.config.initial_backoff;
                shared.connected.store(true, Ordering::SeqCst);
                info!("switch connection established");
                if let Err(e) = run_connection(&shared, transport).await {
                    warn!(error = %e, "switch connection dropped");
                }
                shared.connected.store(false, Ordering::SeqCst);
                fail_pending_waiters(&shared).await;
                *shared.writer.lock().await = None;
            }
            Err(e) => {
                error!(error = %e, "failed to connect to switch");
            }
        }
        debug!(?backoff, "reconnecting to switch after backoff");
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, shared.config.max_backoff);
    }
}

async fn fail_pending_waiters(shared: &Shared) {
    let mut pending = shared.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx; // dropping the sender fails the waiter's rx.await with RecvError
    }
}

async fn run_connection(shared: &Arc<Shared>, transport: BoxTransport) -> std::io::Result<()> {
    let (read_half, mut write_half) = tokio::io::split(transport);
    let mut reader = BufReader::new(read_half);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *shared.writer.lock().await = Some(out_tx.clone());

    let login = Action::new("Login", "login").with_fields(shared.connector.login_fields());
    let _ = out_tx.send(login.encode());

    let write_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    let mut block = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF
        }
        if line.trim().is_empty() {
            if !block.is_empty() {
                if let Some(frame) = parse_block(&block) {
                    dispatch_frame(shared, frame).await;
                }
                block.clear();
            }
        } else {
            block.push_str(&line);
        }
    }

    write_task.abort();
    Ok(())
}

async fn dispatch_frame(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Response(resp) => {
            let mut pending = shared.pending.lock().await;
            if let Some(tx) = pending.remove(&resp.action_id) {
                let _ = tx.send(resp);
            }
        }
        Frame::Event(event) => {
            let _ = shared.events.send(event);
        }
    }
}

impl Action {
    fn with_fields(mut self, fields: Fields) -> Self {
        for (k, v) in fields.iter() {
            self.fields.push(k, v);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct DuplexConnector {
        server: AsyncMutex<Option<tokio::io::DuplexStream>>,
    }

    impl Connector for DuplexConnector {
        fn connect(&self) -> ConnectFuture {
            let server = self.server.try_lock().ok().and_then(|mut g| g.take());
            Box::pin(async move {
                match server {
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

    #[tokio::test]
    async fn send_correlates_response_by_action_id() {
        let (client_side, server_side) = duplex(4096);
        let connector = Arc::new(DuplexConnector {
            server: AsyncMutex::new(Some(client_side)),
        });
        let client = SwitchClient::spawn(connector, ClientConfig::default());

        // Drive the fake switch side: read the login + one action, reply Success.
        let mut server = BufReader::new(server_side);
        tokio::spawn(async move {
            let mut buf = String::new();
            loop {
                buf.clear();
                let mut block = String::new();
                loop {
                    let mut line = String::new();
                    if server.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    if line.trim().is_empty() {
                        break;
                    }
                    block.push_str(&line);
                }
                if let Some(id) = block
                    .lines()
                    .find_map(|l| l.strip_prefix("ActionID: "))
                {
                    let reply = format!("Response: Success\nActionID: {id}\n\n");
                    use tokio::io::AsyncWriteExt;
                    let _ = server.get_mut().write_all(reply.as_bytes()).await;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let resp = client.send("Ping", Fields::new()).await.unwrap();
        assert!(resp.is_success());
    }
}
