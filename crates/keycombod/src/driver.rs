use crate::lease::{SuspendBlocker, SuspendLease};
use crate::scheduler::{ActionId, DeferredActionScheduler};
use crate::state_machine::{ComboActions, ComboError, ComboResources, ComboStateMachine, TrackedKeySet};
use keycombo_core::config::Config;
use keycombo_core::error::ConfigError;
use keycombo_core::ipc::ComboStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Something that delivers key events into the driver until deregistered.
pub trait EventSource: Send {
    fn deregister(&mut self);
}

/// Resolved combo settings the driver is built from.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub down: Vec<u16>,
    pub up: Vec<u16>,
    pub dwell: Duration,
    pub lease_name: String,
    pub queue_capacity: usize,
}

impl DriverSettings {
    pub fn from_config(config: &Config, profile: Option<&str>) -> Result<Self, ConfigError> {
        let keys = config.combo.resolve_keys(profile)?;
        Ok(Self {
            down: keys.down,
            up: keys.up,
            dwell: config.combo.delay(),
            lease_name: config.lease.name.clone(),
            queue_capacity: config.worker.queue_capacity,
        })
    }
}

/// Owns one combo detector together with its worker, leases and event source.
pub struct ComboDriver {
    machine: Arc<ComboStateMachine>,
    scheduler: Arc<DeferredActionScheduler>,
    held_lease: Arc<SuspendLease>,
    up_lease: Arc<SuspendLease>,
    source: Mutex<Option<Box<dyn EventSource>>>,
    shut_down: AtomicBool,
}

impl ComboDriver {
    pub fn new(
        settings: &DriverSettings,
        actions: Arc<dyn ComboActions>,
        blocker: Arc<dyn SuspendBlocker>,
    ) -> Result<Self, ComboError> {
        let scheduler = Arc::new(DeferredActionScheduler::new(settings.queue_capacity)?);
        let held_lease = Arc::new(SuspendLease::new(settings.lease_name.clone(), blocker.clone()));
        let up_lease = Arc::new(SuspendLease::new(format!("{}_up", settings.lease_name), blocker));

        let machine = ComboStateMachine::configure(
            &settings.down,
            &settings.up,
            settings.dwell,
            ComboResources {
                scheduler: Arc::clone(&scheduler),
                held_lease: Arc::clone(&held_lease),
                up_lease: Arc::clone(&up_lease),
                actions,
            },
        )?;

        Ok(Self {
            machine,
            scheduler,
            held_lease,
            up_lease,
            source: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn keys(&self) -> Arc<TrackedKeySet> {
        Arc::clone(self.machine.keys())
    }

    /// Take ownership of the event source; it is deregistered at shutdown.
    pub fn attach(&self, mut source: Box<dyn EventSource>) {
        if self.shut_down.load(Ordering::SeqCst) {
            source.deregister();
            return;
        }
        if let Some(mut previous) = self.source.lock().replace(source) {
            previous.deregister();
        }
    }

    pub fn on_event(&self, code: u16, pressed: bool) -> Result<Option<ActionId>, ComboError> {
        self.machine.on_key_event(code, pressed)
    }

    pub fn status(&self) -> ComboStatus {
        self.machine.status()
    }

    /// Deregister the source, drop the pending held action and drain the worker.
    ///
    /// Once this returns no action runs and no lease is held.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            phase = %self.machine.phase(),
            pending = self.scheduler.pending(),
            "shutting down combo driver"
        );

        if let Some(mut source) = self.source.lock().take() {
            source.deregister();
        }
        self.machine.shutdown();
        self.scheduler.shutdown();

        for lease in [&self.held_lease, &self.up_lease] {
            let leaked = lease.release_all();
            if leaked > 0 {
                warn!(lease = lease.name(), leaked, "lease still held after drain, released");
            }
        }
    }
}

impl Drop for ComboDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
