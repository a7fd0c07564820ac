//! Configuration loading and the process-wide registry.

pub mod loader;
pub mod registry;

pub use loader::ConfigLoader;
pub use registry::ConfigRegistry;
