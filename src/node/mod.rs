pub mod identity;
pub mod monitor;
pub mod registry;

pub use identity::NodeIdentity;
pub use monitor::NodeMonitor;
pub use registry::NodeRegistry;
