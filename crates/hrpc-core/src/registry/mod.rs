//! Service discovery.

mod balance;
mod gate;
mod service_registry;

pub use balance::pick_random;
pub use gate::{InitGate, InitState};
pub use service_registry::{RegistryMap, ServiceRegistry};
