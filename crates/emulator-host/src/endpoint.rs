//! Resolved emulator address and the registry that shares it.
//!
//! The registry is an explicit handle rather than process-wide state:
//! whoever constructs Pub/Sub clients receives a clone of the
//! [`EndpointRegistry`] (or the [`Endpoint`] returned by
//! [`crate::Emulator::start`]) and reads the address from there.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Environment variable understood by Google Cloud client libraries.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Host the emulator binds.
const EMULATOR_HOST: &str = "localhost";

/// Address of a running emulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Endpoint bound on `localhost`.
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self {
            host: EMULATOR_HOST.to_owned(),
            port,
        }
    }

    /// Host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Variable name and value for handing the endpoint to a child process.
    #[must_use]
    pub fn env_pair(&self) -> (&'static str, String) {
        (EMULATOR_HOST_ENV, self.to_string())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Shared slot holding the endpoint of the running emulator, if any.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    inner: Arc<RwLock<Option<Endpoint>>>,
}

impl EndpointRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `endpoint`, replacing any previous value.
    pub fn publish(&self, endpoint: Endpoint) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
    }

    /// Removes the published endpoint.
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns the published endpoint.
    #[must_use]
    pub fn current(&self) -> Option<Endpoint> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
