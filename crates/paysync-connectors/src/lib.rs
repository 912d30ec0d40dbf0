//! # PaySync Connectors
//!
//! Provider plugins and the static registry that builds them by name.

pub mod dummypay;
pub mod registry;

pub use dummypay::DummyPay;
pub use registry::{available_plugins, get_plugin_def, Capability, PluginDef, StaticRegistry};
