//! Optional process-wide manager.
//!
//! Applications that want one connection per process install a manager
//! here (or let [`global`] build one from settings) and reach it from
//! anywhere. Nothing else in the crate depends on it.

use std::sync::{Arc, OnceLock};

use courier_core::CredentialStore;
use tracing::info;

use crate::config::TransportConfig;
use crate::manager::ConnectionManager;

static GLOBAL: OnceLock<ConnectionManager> = OnceLock::new();

/// Install the process-wide manager. Gives `manager` back if one is
/// already installed.
pub fn install(manager: ConnectionManager) -> Result<(), ConnectionManager> {
    GLOBAL.set(manager)
}

/// The installed manager, if any.
pub fn try_global() -> Option<&'static ConnectionManager> {
    GLOBAL.get()
}

/// The process-wide manager, built on first use from the loaded settings,
/// WebSocket links and [`CredentialStore::global`].
pub fn global() -> &'static ConnectionManager {
    GLOBAL.get_or_init(|| {
        let settings = courier_settings::get_settings();
        let config = TransportConfig::from_settings(&settings.transport);
        info!(url = %config.url, "building process-wide connection manager");
        ConnectionManager::websocket(config, Arc::new(CredentialStore::global()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Connector;
    use crate::mock::MockConnector;
    use courier_core::StaticToken;

    #[test]
    fn install_once() {
        let manager = ConnectionManager::new(
            TransportConfig::default(),
            Arc::new(MockConnector::new()) as Arc<dyn Connector>,
            Arc::new(StaticToken::new("tok")),
        );
        let second = manager.clone();
        assert!(install(manager).is_ok());
        assert!(install(second).is_err());

        let installed = try_global().unwrap();
        assert_eq!(installed.consumer_count(), 0);
        assert!(std::ptr::eq(installed, global()));
    }
}
