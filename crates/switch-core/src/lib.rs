//! Protocol framing and a persistent, reconnecting client for a
//! line-oriented telephony switch management channel (`Action:`/`ActionID:`
//! requests, `Event:`-tagged asynchronous notifications).
//!
//! This crate never speaks SIP or RTP — it drives an existing switch
//! through its management and control channels, per the system's scope.

mod agi;
mod client;
mod error;
pub mod proto;
mod tcp;

pub use agi::{accept_agi_session, AgiConnection, AgiRequest, AgiResult};
pub use client::{
    BoxTransport, ClientConfig, ConnectFuture, Connector, EventSubscription, SwitchClient,
    SwitchTransport,
};
pub use error::{Result, SwitchError};
pub use proto::{Action, Fields, Frame, Response, SwitchEvent};
pub use tcp::TcpConnector;
