//! Connector handing out the simulated instrument on every endpoint.

use crate::instrument::SimulatedInstrument;
use async_trait::async_trait;
use parking_lot::Mutex;
use scanbot_core::capabilities::{InstrumentHandle, InstrumentPool};
use scanbot_core::error::ScanbotError;
use scanbot_pool::{ConnectionPool, Connector, Endpoint};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ConnectorStats {
    connects: u32,
    disconnects: u32,
    refused: HashSet<u16>,
}

/// Every endpoint connects to the same [`SimulatedInstrument`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    instrument: SimulatedInstrument,
    stats: Arc<Mutex<ConnectorStats>>,
}

impl MockConnector {
    /// Connector for `instrument`.
    pub fn new(instrument: SimulatedInstrument) -> Self {
        Self {
            instrument,
            stats: Arc::new(Mutex::new(ConnectorStats::default())),
        }
    }

    /// Refuse connections on `port`.
    pub fn refuse_port(&self, port: u16) {
        self.stats.lock().refused.insert(port);
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u32 {
        self.stats.lock().connects
    }

    /// Disconnects so far.
    pub fn disconnects(&self) -> u32 {
        self.stats.lock().disconnects
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> u32 {
        let stats = self.stats.lock();
        stats.connects.saturating_sub(stats.disconnects)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = InstrumentHandle;
    type Error = ScanbotError;

    async fn connect(&self, endpoint: &Endpoint) -> Result<InstrumentHandle, ScanbotError> {
        let mut stats = self.stats.lock();
        if stats.refused.contains(&endpoint.port) {
            return Err(ScanbotError::InstrumentUnavailable(format!(
                "connection refused by {endpoint}"
            )));
        }
        stats.connects += 1;
        tracing::debug!(%endpoint, "MockConnector: connected");
        Ok(Arc::new(self.instrument.clone()))
    }

    async fn disconnect(&self, _connection: InstrumentHandle) -> Result<(), ScanbotError> {
        self.stats.lock().disconnects += 1;
        Ok(())
    }
}

/// Pool of `ports` simulated endpoints on localhost starting at 6501.
pub fn simulated_pool(connector: MockConnector, ports: u16) -> InstrumentPool {
    let endpoints = (0..ports.max(1)).map(|i| Endpoint::new("127.0.0.1", 6501 + i));
    ConnectionPool::new(endpoints, Arc::new(connector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbot_core::capabilities::BiasControl;

    #[tokio::test]
    async fn test_pool_leases_share_state() {
        let instrument = SimulatedInstrument::new();
        let connector = MockConnector::new(instrument.clone());
        let pool = simulated_pool(connector.clone(), 2);

        let lease = pool.lease().await.unwrap();
        lease.connection().bias_set(0.5).await.unwrap();
        assert_eq!(instrument.bias_history(), vec![0.5]);
        assert_eq!(connector.open_connections(), 1);

        lease.release().await.unwrap();
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_refused_port_is_unavailable() {
        let connector = MockConnector::new(SimulatedInstrument::new());
        connector.refuse_port(6501);
        let pool = simulated_pool(connector, 1);
        assert!(pool.lease().await.is_err());
        assert_eq!(pool.available(), 1);
    }
}
