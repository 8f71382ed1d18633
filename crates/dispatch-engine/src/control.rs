//! Per-call control channel server: the switch opens one TCP connection
//! per answered channel here, carrying its environment (channel name,
//! unique id, our injected correlation id and project id) before any
//! command is accepted. Each accepted connection is handed to the IVR
//! session handler for the lifetime of that call.

use std::net::SocketAddr;
use std::sync::Arc;

use apicall_switch_core::{accept_agi_session, BoxTransport};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::ivr::IvrSessionHandler;

pub struct ControlChannelServer {
    bind_addr: SocketAddr,
    ivr: Arc<IvrSessionHandler>,
}

impl ControlChannelServer {
    pub fn new(bind_addr: SocketAddr, ivr: Arc<IvrSessionHandler>) -> Self {
        Self { bind_addr, ivr }
    }

    /// Runs forever, accepting one connection per answered channel.
    /// Intended to be spawned as a long-lived background task by the
    /// engine.
    pub async fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %self.bind_addr, error = %e, "failed to bind control channel server");
                return;
            }
        };
        info!(addr = %self.bind_addr, "control channel server listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ivr = self.ivr.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ivr).await {
                            warn!(peer = %peer, error = %e, "control channel session failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control channel accept failed");
                }
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ivr: &IvrSessionHandler) -> Result<()> {
    let transport: BoxTransport = Box::new(stream);
    let (request, conn) = accept_agi_session(transport).await?;
    let Some(correlation_id) = request.get("agi_corr_id").map(str::to_string) else {
        warn!("control channel session carries no correlation id, dropping");
        return Ok(());
    };
    ivr.run_session(&correlation_id, request, conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use apicall_switch_core::{ClientConfig, ConnectFuture, Connector, Fields, SwitchClient};
    use serial_test::serial;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use crate::db::DatabaseManager;
    use crate::tracker::ActiveCallTracker;

    struct DeadConnector;

    impl Connector for DeadConnector {
        fn connect(&self) -> ConnectFuture {
            Box::pin(async move { Err(std::io::Error::new(std::io::ErrorKind::Other, "no switch in this test")) })
        }

        fn login_fields(&self) -> Fields {
            Fields::new()
        }
    }

    // Binds a fixed port so this test can't overlap another run of itself
    // racing for the same listener.
    const TEST_BIND_ADDR: &str = "127.0.0.1:47411";

    #[tokio::test]
    #[serial]
    async fn accepts_connection_and_dispatches_to_the_ivr_handler() {
        let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
        let tracker = Arc::new(ActiveCallTracker::new());
        let switch = SwitchClient::spawn(Arc::new(DeadConnector), ClientConfig::default());
        let ivr = Arc::new(IvrSessionHandler::new(db, tracker, switch, Duration::from_secs(1)));

        let addr: SocketAddr = TEST_BIND_ADDR.parse().unwrap();
        let server = Arc::new(ControlChannelServer::new(addr, ivr));
        let handle = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"agi_channel: SIP/test-1\nagi_corr_id: unknown-correlation\n\n")
            .await
            .unwrap();

        // No tracked call matches this correlation id, so `run_session`
        // returns immediately without issuing any AGI command and the
        // connection is simply closed.
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_millis(500), reader.read_line(&mut line)).await;
        assert!(matches!(read, Ok(Ok(_)) | Err(_)));

        handle.abort();
    }
}
