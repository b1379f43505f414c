//! # courier-transport
//!
//! One shared real-time connection for every consumer in the process.
//!
//! - Connection supervisor: activation, STOMP handshake, heartbeats, fixed-delay reconnect
//! - Subscription registry: at most one subscription per topic, replayed on reconnect
//! - Handler directory and dispatcher: every inbound envelope goes to every handler
//! - Publish path: validated envelopes to a single send destination
//! - [`ConnectionManager`]: attach/detach bookkeeping, teardown on last detach
//! - Links over `tokio-tungstenite` ([`WsConnector`]) or in memory ([`MockConnector`])

#![deny(unsafe_code)]

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod frame;
pub mod heartbeat;
pub mod link;
pub mod manager;
pub mod mock;
pub mod protocol;
pub mod publish;
pub mod registry;
pub mod shared;
pub mod stats;
pub mod supervisor;
pub mod ws;

pub use config::TransportConfig;
pub use directory::{ConsumerCallbacks, HandlerDirectory, HandlerId, HandlerSlot, Retired};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use frame::{Command, Frame};
pub use link::{Connector, Link, LinkEvent, LinkPeer};
pub use manager::{ConnectionManager, ConsumerHandle};
pub use mock::{MockConnector, MockSession};
pub use protocol::{HeartbeatConfig, NegotiatedHeartbeat};
pub use publish::PublishPath;
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use stats::{StatsSnapshot, TransportStats};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use ws::WsConnector;
