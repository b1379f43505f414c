//! Consumer attachment and connection lifetime.
//!
//! The connection exists exactly while at least one consumer is attached:
//! the first `attach` activates it, the last `detach` tears it down along
//! with every subscription and callback.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{ConsumerId, CredentialSource, MessageEnvelope, Result, Topic};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::directory::{ConsumerCallbacks, HandlerDirectory};
use crate::link::Connector;
use crate::protocol::NegotiatedHeartbeat;
use crate::publish::PublishPath;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::ws::WsConnector;

struct Shared {
    // lifecycle lock: attach and detach are serialised on it
    consumers: Mutex<BTreeSet<ConsumerId>>,
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<SubscriptionRegistry>,
    directory: Arc<HandlerDirectory>,
    publish: PublishPath,
    stats: Arc<TransportStats>,
}

/// Entry point: attach consumers, send messages.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager opening links through `connector`.
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let stats = Arc::new(TransportStats::default());
        let registry = Arc::new(SubscriptionRegistry::new(config.topic_prefix.clone()));
        let directory = Arc::new(HandlerDirectory::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config,
            connector,
            credentials,
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&stats),
        ));
        let publish = PublishPath::new(Arc::clone(&supervisor), Arc::clone(&stats));
        Self {
            shared: Arc::new(Shared {
                consumers: Mutex::new(BTreeSet::new()),
                supervisor,
                registry,
                directory,
                publish,
                stats,
            }),
        }
    }

    /// Manager over real WebSocket connections.
    pub fn websocket(config: TransportConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let connector = Arc::new(WsConnector::new(&config));
        Self::new(config, connector, credentials)
    }

    /// Attach a consumer interested in `topic`.
    ///
    /// Activates the connection if this is the first consumer, registers
    /// `callbacks` and makes sure `topic` is subscribed (deferred until the
    /// connection is up). Returns before the handshake completes.
    ///
    /// # Errors
    ///
    /// `MissingCredentials` or `NoRuntime` from activation. The consumer is
    /// not recorded in that case.
    pub fn attach(&self, topic: &Topic, callbacks: ConsumerCallbacks) -> Result<ConsumerHandle> {
        let shared = &self.shared;
        let consumer = ConsumerId::new();

        let mut consumers = shared.consumers.lock();
        let _ = consumers.insert(consumer.clone());
        if let Err(error) = shared.supervisor.activate() {
            let _ = consumers.remove(&consumer);
            warn!(%topic, error = %error, "attach failed");
            return Err(error);
        }
        let _ = shared.directory.register_consumer(&consumer, callbacks);
        let subscription = shared.registry.ensure_subscribed(topic);
        let attached = consumers.len();
        drop(consumers);

        info!(consumer_id = %consumer, %topic, attached, "consumer attached");
        Ok(ConsumerHandle {
            manager: self.clone(),
            consumer,
            subscription,
            detached: false,
        })
    }

    /// Detach `consumer`. The last detach tears the connection down.
    ///
    /// When this returns, the consumer's message handler is not running on
    /// another thread and will not be called again. Returns `false` if
    /// `consumer` was not attached.
    pub fn detach(&self, consumer: &ConsumerId) -> bool {
        let shared = &self.shared;
        let mut consumers = shared.consumers.lock();
        if !consumers.remove(consumer) {
            debug!(consumer_id = %consumer, "detach of unknown consumer ignored");
            return false;
        }
        let retired = shared.directory.unregister_consumer(consumer);
        let remaining = consumers.len();
        if remaining == 0 {
            shared.supervisor.deactivate();
        }
        drop(consumers);

        // a handler mid-call may itself take the lifecycle lock
        if let Some(retired) = retired {
            retired.wait();
        }

        info!(consumer_id = %consumer, remaining, "consumer detached");
        true
    }

    /// Publish `envelope` on the shared connection.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        self.shared.publish.send(envelope).await
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.shared.consumers.lock().len()
    }

    /// Whether `consumer` is attached.
    pub fn is_attached(&self, consumer: &ConsumerId) -> bool {
        self.shared.consumers.lock().contains(consumer)
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.supervisor.state()
    }

    /// Receiver that sees every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.supervisor.subscribe_state()
    }

    /// Wait until the connection reaches `target`. `false` on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.shared.supervisor.wait_for_state(target, timeout).await
    }

    /// Heart-beat intervals of the current connection.
    pub fn negotiated_heartbeat(&self) -> Option<NegotiatedHeartbeat> {
        self.shared.supervisor.negotiated_heartbeat()
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        self.shared.registry.topics()
    }

    /// Number of subscribed topics.
    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Number of registered message handlers.
    pub fn handler_count(&self) -> usize {
        self.shared.directory.handler_count()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The configuration in use.
    pub fn config(&self) -> &TransportConfig {
        self.shared.supervisor.config()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("consumers", &self.consumer_count())
            .field("supervisor", &self.shared.supervisor)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

/// One attached consumer. Dropping it detaches.
pub struct ConsumerHandle {
    manager: ConnectionManager,
    consumer: ConsumerId,
    subscription: SubscriptionHandle,
    detached: bool,
}

impl ConsumerHandle {
    /// This consumer's id.
    pub fn id(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Topic this consumer attached for.
    pub fn topic(&self) -> &Topic {
        &self.subscription.topic
    }

    /// The (possibly shared) subscription for [`topic`](Self::topic).
    pub fn subscription(&self) -> &SubscriptionHandle {
        &self.subscription
    }

    /// Publish through the shared connection.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        self.manager.send(envelope).await
    }

    /// The manager this consumer is attached to.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Detach now. Returns `false` if the consumer was already gone.
    pub fn detach(mut self) -> bool {
        self.detached = true;
        self.manager.detach(&self.consumer)
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.manager.detach(&self.consumer);
        }
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("consumer", &self.consumer)
            .field("topic", &self.subscription.topic)
            .field("subscription_id", &self.subscription.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::protocol::HeartbeatConfig;
    use assert_matches::assert_matches;
    use courier_core::{CourierError, CredentialStore, StaticToken};

    fn manager() -> (ConnectionManager, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let config = TransportConfig::default()
            .with_url("ws://mock/ws")
            .with_heartbeat(HeartbeatConfig::DISABLED);
        let manager = ConnectionManager::new(
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(StaticToken::new("tok")),
        );
        (manager, connector)
    }

    #[tokio::test]
    async fn first_attach_activates() {
        let (manager, _) = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let handle = manager
            .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.consumer_count(), 1);
        assert!(manager.is_attached(handle.id()));
        assert_eq!(handle.topic().as_str(), "messages/U1");
        assert_eq!(handle.subscription().destination, "/topic/messages/U1");
    }

    #[tokio::test]
    async fn same_topic_shares_subscription() {
        let (manager, _) = manager();
        let topic = Topic::for_recipient("U1");
        let a = manager.attach(&topic, ConsumerCallbacks::new()).unwrap();
        let b = manager.attach(&topic, ConsumerCallbacks::new()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.subscription().id, b.subscription().id);
        assert_eq!(manager.subscription_count(), 1);
    }

    #[tokio::test]
    async fn last_detach_tears_down() {
        let (manager, _) = manager();
        let a = manager
            .attach(
                &Topic::for_recipient("U1"),
                ConsumerCallbacks::new().on_message(|_| {}),
            )
            .unwrap();
        let b = manager
            .attach(
                &Topic::for_recipient("U2"),
                ConsumerCallbacks::new().on_message(|_| {}),
            )
            .unwrap();
        assert_eq!(manager.handler_count(), 2);

        assert!(a.detach());
        assert_eq!(manager.consumer_count(), 1);
        assert_eq!(manager.handler_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert!(b.detach());
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(manager.handler_count(), 0);
    }

    #[tokio::test]
    async fn drop_detaches() {
        let (manager, _) = manager();
        {
            let _handle = manager
                .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
                .unwrap();
            assert_eq!(manager.consumer_count(), 1);
        }
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unknown_detach_is_noop() {
        let (manager, _) = manager();
        let handle = manager
            .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
            .unwrap();
        assert!(!manager.detach(&ConsumerId::new()));
        assert_eq!(manager.consumer_count(), 1);

        let id = handle.id().clone();
        assert!(handle.detach());
        assert!(!manager.detach(&id));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn missing_credentials_roll_back() {
        let connector = Arc::new(MockConnector::new());
        let manager = ConnectionManager::new(
            TransportConfig::default().with_url("ws://mock/ws"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(CredentialStore::new()),
        );
        assert_matches!(
            manager.attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new()),
            Err(CourierError::MissingCredentials)
        );
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn send_after_teardown_is_not_connected() {
        let (manager, connector) = manager();
        let handle = manager
            .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
            .unwrap();
        let mut session = connector.next_session().await.unwrap();
        let _ = session.accept().await.unwrap();
        assert!(
            manager
                .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );
        let env = MessageEnvelope::text("U1", "U2", "hi");
        handle.send(&env).await.unwrap();

        drop(handle);
        assert_matches!(manager.send(&env).await, Err(CourierError::NotConnected));
    }

    #[tokio::test]
    async fn reattach_after_teardown_reconnects() {
        let (manager, connector) = manager();
        let first = manager
            .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
            .unwrap();
        let _ = connector.next_session().await.unwrap();
        drop(first);

        let _second = manager
            .attach(&Topic::for_recipient("U1"), ConsumerCallbacks::new())
            .unwrap();
        let mut session = connector.next_session().await.unwrap();
        let _ = session.accept().await.unwrap();
        assert!(
            manager
                .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
                .await
        );
        assert_eq!(connector.connect_count(), 2);
    }
}
