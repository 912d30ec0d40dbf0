pub mod bus;
pub mod heartbeat;
pub mod plugin;
pub mod registry;
pub mod storage;

pub use bus::MessageBus;
pub use heartbeat::{Heartbeat, NoopHeartbeat};
pub use plugin::Plugin;
pub use registry::PluginRegistry;
pub use storage::Storage;
