//! Top-level lifecycle wiring: connects the switch client, persistence,
//! admission control, and the four background components into one
//! runnable process.

use std::net::SocketAddr;
use std::sync::Arc;

use apicall_switch_core::{ClientConfig as SwitchClientConfig, Connector, SwitchClient};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{self, ApiState};
use crate::config::ApicallConfig;
use crate::control::ControlChannelServer;
use crate::db::DatabaseManager;
use crate::error::Result;
use crate::event_handler::EventHandler;
use crate::ivr::IvrSessionHandler;
use crate::originator::Originator;
use crate::pool::ChannelPool;
use crate::reaper::OrphanReaper;
use crate::sweeper::CampaignSweeper;
use crate::tracker::ActiveCallTracker;

/// A running engine: the admission pool, tracker, and the background
/// tasks that drive calls through it. Holds join handles so `stop` can
/// cancel them cleanly.
pub struct Engine {
    config: ApicallConfig,
    db: Arc<DatabaseManager>,
    pool: Arc<ChannelPool>,
    tracker: Arc<ActiveCallTracker>,
    switch: SwitchClient,
    originator: Arc<Originator>,
    api_bearer_tokens: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Wires up every component against a fresh database connection
    /// without starting any background task. `connector` supplies the
    /// real TCP transport in production and a fake one in tests.
    pub async fn new(mut config: ApicallConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let db = Arc::new(DatabaseManager::new(&config.database.dsn).await?);
        for (key, value) in db.get_config_overrides().await? {
            info!(key, value, "applying config override from database");
            config.apply_override(&key, &value);
        }

        let pool = Arc::new(ChannelPool::new(config.general.max_channels, config.general.max_cps));
        for trunk in db.list_trunks().await? {
            if trunk.active {
                pool.register_trunk(trunk.name.clone(), config.general.max_per_trunk.min(trunk.max_channels));
            }
        }

        let tracker = Arc::new(ActiveCallTracker::new());
        let switch = SwitchClient::spawn(
            connector,
            SwitchClientConfig {
                request_timeout: std::time::Duration::from_secs(5),
                ..SwitchClientConfig::default()
            },
        );

        let originator = Arc::new(Originator::new(
            db.clone(),
            pool.clone(),
            tracker.clone(),
            switch.clone(),
            "apicall-ivr",
        ));

        Ok(Self {
            config,
            db,
            pool,
            tracker,
            switch,
            originator,
            api_bearer_tokens: Vec::new(),
            tasks: Vec::new(),
        })
    }

    pub fn with_bearer_tokens(mut self, tokens: Vec<String>) -> Self {
        self.api_bearer_tokens = tokens;
        self
    }

    /// Spawns the event handler, IVR handler, sweeper, reaper, and REST
    /// API as background tasks. Returns once they're all running; they
    /// continue until `stop` is called or the process exits.
    pub async fn start(&mut self) -> Result<()> {
        let ivr = Arc::new(IvrSessionHandler::new(
            self.db.clone(),
            self.tracker.clone(),
            self.switch.clone(),
            std::time::Duration::from_secs(self.config.timing.ivr_digit_grace_secs),
        ));

        let control = Arc::new(ControlChannelServer::new(self.config.general.fastagi_bind_addr, ivr));
        self.tasks.push(tokio::spawn(control.run()));

        let event_handler = Arc::new(EventHandler::new(self.db.clone(), self.tracker.clone(), self.switch.clone()));
        self.tasks.push(tokio::spawn(event_handler.run()));

        let sweeper = Arc::new(CampaignSweeper::new(
            self.db.clone(),
            self.pool.clone(),
            self.originator.clone(),
            self.config.timing.sweeper_tick(),
            self.config.timing.sweeper_batch_cap,
        ));
        self.tasks.push(tokio::spawn(sweeper.run()));

        let reaper = Arc::new(OrphanReaper::new(
            self.db.clone(),
            self.tracker.clone(),
            self.switch.clone(),
            self.config.timing.reaper_tick(),
            self.config.timing.reaper_horizon_secs,
            self.config.timing.reaper_hard_ceiling_secs,
        ));
        self.tasks.push(tokio::spawn(reaper.run()));

        let api_state = Arc::new(ApiState {
            originator: self.originator.clone(),
            pool: self.pool.clone(),
            tracker: self.tracker.clone(),
            db: self.db.clone(),
            bearer_tokens: self.api_bearer_tokens.clone(),
        });
        let api_addr: SocketAddr = self.config.general.api_bind_addr;
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(api_addr, api_state).await {
                tracing::error!(error = %e, "api server exited");
            }
        }));

        info!("engine started: event handler, control channel, sweeper, reaper, and api are running");
        Ok(())
    }

    /// Aborts every background task. Does not wait for in-flight calls
    /// to drain — the process is expected to exit shortly after.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }

    /// Blocks until a shutdown signal arrives, then stops cleanly.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }

    pub fn originator(&self) -> &Arc<Originator> {
        &self.originator
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<ActiveCallTracker> {
        &self.tracker
    }
}
