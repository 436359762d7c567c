//! Storage instance lifecycle.
//!
//! A `StorageInstance` is one logical tenant/user-pool's database access
//! context. It owns the resource registry, the enabled flag, and the
//! interrupt channel that lets an external shutdown abort a blocked
//! startup. Constructing an instance also yields its `InitToken`: the
//! explicit ownership credential required for first-time pool
//! initialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::PgConfig;
use crate::error::ConfigError;
use crate::recorder::ProcessStateRecorder;
use crate::registry::ResourceRegistry;

/// Registry key for the process state recorder singleton.
const RECORDER_KEY: &str = "process-state-recorder";

/// One logical tenant/user-pool's database access context.
pub struct StorageInstance {
    id: Uuid,
    user_pool_id: String,
    config: PgConfig,
    enabled: AtomicBool,
    registry: ResourceRegistry,
    interrupt: Notify,
    interrupt_requested: AtomicBool,
}

/// Non-clonable credential for first-time pool initialization.
///
/// Handed out exactly once per instance; whichever context holds it is
/// the designated owner. Checking the token at call time replaces the
/// fragile thread-handle comparison a thread-affinity rule would need.
#[derive(Debug)]
pub struct InitToken {
    instance_id: Uuid,
}

impl InitToken {
    pub fn owns(&self, instance: &StorageInstance) -> bool {
        self.instance_id == instance.id
    }
}

impl StorageInstance {
    /// Create an instance from a validated config, returning the instance
    /// and its one init token.
    pub fn new(
        user_pool_id: impl Into<String>,
        config: PgConfig,
    ) -> Result<(Arc<Self>, InitToken), ConfigError> {
        config.validate()?;
        let id = Uuid::new_v4();
        let instance = Arc::new(Self {
            id,
            user_pool_id: user_pool_id.into(),
            config,
            enabled: AtomicBool::new(true),
            registry: ResourceRegistry::new(),
            interrupt: Notify::new(),
            interrupt_requested: AtomicBool::new(false),
        });
        Ok((instance, InitToken { instance_id: id }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_pool_id(&self) -> &str {
        &self.user_pool_id
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the storage layer on or off. Purely reactive: the next call
    /// against this instance sees the new state, nothing is woken or
    /// re-driven.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!(user_pool_id = %self.user_pool_id, enabled, "storage layer toggled");
    }

    /// The recorder singleton for this instance, created on first access.
    ///
    /// If a caller has bound a foreign resource under the recorder's key,
    /// the registry entry is left untouched and a detached recorder is
    /// returned instead.
    pub fn recorder(&self) -> Arc<ProcessStateRecorder> {
        let test_mode = self.config.pool.test_mode();
        self.registry
            .get_or_create(RECORDER_KEY, || Arc::new(ProcessStateRecorder::new(test_mode)))
            .unwrap_or_else(|| Arc::new(ProcessStateRecorder::new(test_mode)))
    }

    /// Signal an external shutdown. Aborts a pool-init retry wait that is
    /// currently blocked on this instance.
    pub fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
        self.interrupt.notify_waiters();
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    pub fn interrupt(&self) -> &Notify {
        &self.interrupt
    }
}

impl std::fmt::Debug for StorageInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageInstance")
            .field("id", &self.id)
            .field("user_pool_id", &self.user_pool_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
