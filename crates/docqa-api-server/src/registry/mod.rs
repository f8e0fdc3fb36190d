pub mod instance;
pub mod monitor;
pub mod registry;

pub use instance::{HealthState, InFlightGuard, InstanceSnapshot, ModelInstance};
pub use monitor::HealthMonitor;
pub use registry::{InstanceRegistry, SelectionStrategy};
