//! Fixed endpoint pool for instrument connections.
//!
//! The instrument controller accepts a small, fixed number of TCP ports. A
//! procedure leases exactly one of them for its whole run, while short side
//! jobs (an immediate scan stop issued by the supervisor) lease another.
//!
//! # Lease Model
//!
//! 1. [`ConnectionPool::lease`] pops a free endpoint and opens a connection
//!    through the pool's [`Connector`]
//! 2. The returned [`Lease`] owns the connection exclusively
//! 3. [`Lease::release`] closes the connection and returns the endpoint
//! 4. Dropping a [`Lease`] without releasing still returns the endpoint, so
//!    error paths and panics never leak a port
//!
//! An empty free list is reported as [`PoolError::Exhausted`]. Nothing is
//! queued or retried; an exhausted pool needs operator intervention.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use scanbot_pool::{ConnectionPool, Connector, Endpoint};
//!
//! struct Loopback;
//!
//! #[async_trait]
//! impl Connector for Loopback {
//!     type Connection = u16;
//!     type Error = std::io::Error;
//!
//!     async fn connect(&self, endpoint: &Endpoint) -> Result<u16, std::io::Error> {
//!         Ok(endpoint.port)
//!     }
//!
//!     async fn disconnect(&self, _connection: u16) -> Result<(), std::io::Error> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = ConnectionPool::new([Endpoint::new("127.0.0.1", 6501)], Loopback);
//! let lease = pool.lease().await.unwrap();
//! assert_eq!(*lease.connection(), 6501);
//! assert!(pool.lease().await.is_err());
//!
//! lease.release().await.unwrap();
//! assert_eq!(pool.available(), 1);
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Network address of one controller port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address of the controller
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens and closes connections to a single endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Handle to an open connection
    type Connection: Clone + Send + Sync + 'static;
    /// Error reported by connect/disconnect
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a connection (including any handshake) to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, Self::Error>;

    /// Close a connection previously returned by [`Connector::connect`].
    async fn disconnect(&self, connection: Self::Connection) -> Result<(), Self::Error>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    type Connection = T::Connection;
    type Error = T::Error;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, Self::Error> {
        (**self).connect(endpoint).await
    }

    async fn disconnect(&self, connection: Self::Connection) -> Result<(), Self::Error> {
        (**self).disconnect(connection).await
    }
}

/// Errors reported by [`ConnectionPool::lease`].
#[derive(Debug, Error)]
pub enum PoolError<E: std::error::Error + 'static> {
    /// Every endpoint is currently leased.
    #[error("No ports available: all {capacity} endpoints are leased")]
    Exhausted {
        /// Number of endpoints the pool was created with
        capacity: usize,
    },

    /// The connector could not open a connection; the endpoint was returned.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint the connection attempt targeted
        endpoint: Endpoint,
        /// Underlying connector error
        #[source]
        source: E,
    },
}

struct Shared<C> {
    connector: C,
    free: Mutex<Vec<Endpoint>>,
    capacity: usize,
}

impl<C> Shared<C> {
    fn give_back(&self, endpoint: Endpoint) {
        debug!(%endpoint, "Endpoint returned to pool");
        self.free.lock().push(endpoint);
    }
}

/// Pool of controller endpoints with exclusive leases.
pub struct ConnectionPool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool over `endpoints`; the first endpoint is leased first.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>, connector: C) -> Self {
        let mut free: Vec<Endpoint> = endpoints.into_iter().collect();
        free.reverse();
        let capacity = free.len();

        Self {
            shared: Arc::new(Shared {
                connector,
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    /// Number of endpoints the pool was created with.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of endpoints not currently leased.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Lease a free endpoint and connect to it.
    pub async fn lease(&self) -> Result<Lease<C>, PoolError<C::Error>> {
        let endpoint = self.shared.free.lock().pop();
        let Some(endpoint) = endpoint else {
            error!(
                capacity = self.shared.capacity,
                "Connection pool exhausted - operator intervention required"
            );
            return Err(PoolError::Exhausted {
                capacity: self.shared.capacity,
            });
        };

        match self.shared.connector.connect(&endpoint).await {
            Ok(connection) => {
                debug!(%endpoint, "Leased instrument endpoint");
                Ok(Lease {
                    endpoint,
                    connection,
                    shared: Arc::clone(&self.shared),
                    returned: false,
                })
            }
            Err(source) => {
                warn!(%endpoint, error = %source, "Connection attempt failed");
                self.shared.give_back(endpoint.clone());
                Err(PoolError::Connect { endpoint, source })
            }
        }
    }
}

/// Exclusive use of one endpoint and its open connection.
///
/// The endpoint goes back to the pool on [`Lease::release`] or on drop.
pub struct Lease<C: Connector> {
    endpoint: Endpoint,
    connection: C::Connection,
    shared: Arc<Shared<C>>,
    returned: bool,
}

impl<C: Connector> Lease<C> {
    /// The leased endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The open connection.
    pub fn connection(&self) -> &C::Connection {
        &self.connection
    }

    /// Close the connection and return the endpoint to the pool.
    ///
    /// The endpoint is returned even when closing fails.
    pub async fn release(mut self) -> Result<(), C::Error> {
        let result = self
            .shared
            .connector
            .disconnect(self.connection.clone())
            .await;
        if let Err(e) = &result {
            warn!(endpoint = %self.endpoint, error = %e, "Disconnect failed");
        }
        self.returned = true;
        self.shared.give_back(self.endpoint.clone());
        result
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if !self.returned {
            debug!(endpoint = %self.endpoint, "Lease dropped without release");
            self.returned = true;
            self.shared.give_back(self.endpoint.clone());
        }
    }
}

impl<C: Connector> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.endpoint)
            .field("returned", &self.returned)
            .finish()
    }
}
