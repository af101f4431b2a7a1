//! Typestate builder for [`RotationManager`]

use std::marker::PhantomData;
use std::sync::Arc;

use tumbler_core::{Clock, SystemClock};
use tumbler_session::SessionClient;

use super::RotationManager;
use crate::config::RotationConfig;
use crate::error::{RotationError, RotationResult};
use crate::store::Store;

// Type-level markers for builder typestate pattern
#[doc(hidden)]
pub struct Yes;
#[doc(hidden)]
pub struct No;

/// Builder for [`RotationManager`]
///
/// The store is required and enforced at compile time; clock, config and
/// broker session are optional.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tumbler_rotation::{MemoryStore, RotationConfig, RotationManager};
///
/// let manager = RotationManager::builder()
///     .store(Arc::new(MemoryStore::new()))
///     .config(RotationConfig::default().with_workers(2))
///     .build()
///     .unwrap();
/// assert!(manager.is_enabled());
/// ```
pub struct RotationManagerBuilder<HasStore> {
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    config: RotationConfig,
    session: Option<SessionClient>,
    _marker: PhantomData<HasStore>,
}

impl RotationManagerBuilder<No> {
    /// Create new builder instance
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            config: RotationConfig::default(),
            session: None,
            _marker: PhantomData,
        }
    }

    /// Set the job store (required)
    pub fn store(self, store: Arc<dyn Store>) -> RotationManagerBuilder<Yes> {
        RotationManagerBuilder {
            store: Some(store),
            clock: self.clock,
            config: self.config,
            session: self.session,
            _marker: PhantomData,
        }
    }
}

impl<S> RotationManagerBuilder<S> {
    /// Time source; defaults to [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Manager configuration
    pub fn config(mut self, config: RotationConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker session serving out-of-band rotation requests
    pub fn session(mut self, session: SessionClient) -> Self {
        self.session = Some(session);
        self
    }
}

impl RotationManagerBuilder<Yes> {
    /// Validate the configuration and build the manager
    pub fn build(self) -> RotationResult<RotationManager> {
        self.config.validate()?;
        let store = self.store.ok_or_else(|| RotationError::Config {
            reason: "a store is required".to_string(),
        })?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(RotationManager::new(self.config, store, clock, self.session))
    }
}

impl Default for RotationManagerBuilder<No> {
    fn default() -> Self {
        Self::new()
    }
}
