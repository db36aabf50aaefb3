//! Driver framework
//!
//! Lifecycle, capability gating and health reporting for fabric drivers,
//! plus the factory/manager pair that runs them. A driver moves through
//! `Unknown -> Starting -> Healthy -> (Degraded <-> Failing) -> Stopped`;
//! the capability check in `initialize` is a policy gate, the real
//! privilege boundary lives outside this crate.

pub mod cancel;
pub mod factory;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};
use crate::server::FileServer;

pub use cancel::CancelToken;
pub use factory::{DriverConstructor, DriverFactory};
pub use manager::DriverManager;

// ============================================================================
// Capabilities
// ============================================================================

/// Bitmask of resource classes a driver needs access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub u64);

impl Capability {
    pub const NONE: Capability = Capability(0);
    /// Can serve files over 9P
    pub const FILE_SYSTEM: Capability = Capability(1 << 0);
    /// Can access hardware devices
    pub const DEVICE_ACCESS: Capability = Capability(1 << 1);
    /// Can exchange pages with other processes
    pub const PAGE_EXCHANGE: Capability = Capability(1 << 2);
    /// Can use the network stack
    pub const NETWORKING: Capability = Capability(1 << 3);
    /// Can register interrupt handlers
    pub const INTERRUPT: Capability = Capability(1 << 4);
    /// Can perform DMA
    pub const DMA: Capability = Capability(1 << 5);
    pub const ALL: Capability = Capability(u64::MAX);

    /// True when every bit of `required` is present.
    pub fn contains(self, required: Capability) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Capability {
    type Output = Capability;
    fn bitor(self, rhs: Capability) -> Capability {
        Capability(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capability {
    fn bitor_assign(&mut self, rhs: Capability) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Capability {
    type Output = Capability;
    fn bitand(self, rhs: Capability) -> Capability {
        Capability(self.0 & rhs.0)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration handed to a driver at creation and initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Instance name, unique within a manager (e.g. "sata0")
    pub name: String,
    /// Capabilities granted to this driver
    pub capabilities: Capability,
    /// Namespace mount point (e.g. "/dev/sd")
    pub mount_point: String,
    /// Scheduling priority
    pub priority: i32,
    /// Maximum memory in bytes, 0 = unlimited
    pub memory_limit: u64,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capabilities: Capability::NONE,
            mount_point: String::new(),
            priority: 0,
            memory_limit: 0,
            metadata: HashMap::new(),
        }
    }
}

impl DriverConfig {
    pub fn new(name: &str, capabilities: Capability, mount_point: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            mount_point: mount_point.to_string(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    /// Still serving, elevated error rate
    Degraded,
    /// Not serving
    Failing,
    Stopped,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "Unknown",
            HealthStatus::Starting => "Starting",
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Failing => "Failing",
            HealthStatus::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of a driver's health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub message: String,
    pub uptime_seconds: u64,
    pub requests: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Shared health bookkeeping drivers embed. Counters are monotonic until
/// the driver stops.
pub struct HealthState {
    inner: Mutex<HealthInner>,
}

struct HealthInner {
    status: HealthStatus,
    message: String,
    started: Option<Instant>,
    requests: u64,
    errors: u64,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                status: HealthStatus::Unknown,
                message: String::new(),
                started: None,
                requests: 0,
                errors: 0,
                last_error: None,
            }),
        }
    }

    pub fn set_status(&self, status: HealthStatus, message: &str) {
        let mut inner = self.inner.lock();
        if status == HealthStatus::Healthy && inner.started.is_none() {
            inner.started = Some(Instant::now());
        }
        inner.status = status;
        inner.message = message.to_string();
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().status
    }

    pub fn record_request(&self) {
        self.inner.lock().requests += 1;
    }

    pub fn record_error(&self, err: &DriverError) {
        let mut inner = self.inner.lock();
        inner.errors += 1;
        inner.last_error = Some(err.to_string());
    }

    /// Record an invariant violation and transition to Failing.
    pub fn fail(&self, err: &DriverError) {
        let mut inner = self.inner.lock();
        inner.errors += 1;
        inner.last_error = Some(err.to_string());
        inner.status = HealthStatus::Failing;
        inner.message = "internal failure".to_string();
    }

    pub fn snapshot(&self) -> Health {
        let inner = self.inner.lock();
        Health {
            status: inner.status,
            message: inner.message.clone(),
            uptime_seconds: inner
                .started
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            requests: inner.requests,
            errors: inner.errors,
            last_error: inner.last_error.clone(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Driver contracts
// ============================================================================

/// Core lifecycle contract every fabric driver implements.
pub trait Driver: Send + Sync {
    fn name(&self) -> String;

    /// Validate capabilities and prepare resources. Transitions the driver
    /// to Starting. Fails with [`DriverError::Config`] when the config does
    /// not contain the driver's required capability bits.
    fn initialize(&self, config: &DriverConfig) -> DriverResult<()>;

    /// Begin serving. Transitions the driver to Healthy.
    fn start(&self) -> DriverResult<()>;

    /// Stop serving, cancel the driver's root context, transition to
    /// Stopped. Operations initiated afterwards fail with `Stopped`.
    fn stop(&self) -> DriverResult<()>;

    fn health(&self) -> Health;

    fn config(&self) -> DriverConfig;
}

/// Device-management operations for drivers that own hardware.
pub trait DeviceOps: Send + Sync {
    /// Detect and enumerate devices, returning their names.
    fn probe(&self, ctx: &CancelToken) -> DriverResult<Vec<String>>;

    fn attach_device(&self, ctx: &CancelToken, device: &str) -> DriverResult<()>;

    fn detach_device(&self, ctx: &CancelToken, device: &str) -> DriverResult<()>;

    fn handle_interrupt(&self, ctx: &CancelToken, irq: u32) -> DriverResult<()>;
}

/// Capability record produced by a factory constructor: the lifecycle
/// contract plus whatever optional facets the driver composes at
/// construction. Nothing is discovered at runtime.
#[derive(Clone)]
pub struct DriverHandle {
    driver: Arc<dyn Driver>,
    device: Option<Arc<dyn DeviceOps>>,
    files: Option<Arc<dyn FileServer>>,
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("device", &self.device.is_some())
            .field("files", &self.files.is_some())
            .finish()
    }
}

impl DriverHandle {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver, device: None, files: None }
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceOps>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileServer>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceOps>> {
        self.device.as_ref()
    }

    pub fn files(&self) -> Option<&Arc<dyn FileServer>> {
        self.files.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Minimal driver used by factory/manager tests.
    pub struct NullDriver {
        name: String,
        health: HealthState,
        cancel: CancelToken,
    }

    impl NullDriver {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                health: HealthState::new(),
                cancel: CancelToken::new(),
            }
        }
    }

    impl Driver for NullDriver {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn initialize(&self, _config: &DriverConfig) -> DriverResult<()> {
            self.health.set_status(HealthStatus::Starting, "initializing");
            Ok(())
        }

        fn start(&self) -> DriverResult<()> {
            self.health.set_status(HealthStatus::Healthy, "running");
            Ok(())
        }

        fn stop(&self) -> DriverResult<()> {
            self.cancel.cancel();
            self.health.set_status(HealthStatus::Stopped, "stopped");
            Ok(())
        }

        fn health(&self) -> Health {
            self.health.snapshot()
        }

        fn config(&self) -> DriverConfig {
            DriverConfig::new(&self.name, Capability::NONE, "")
        }
    }
}
