//! Core kernel for PeerLink.
//!
//! The kernel assembles a platform: it loads configuration, owns the event
//! bus, the agent directory and the local router, and starts the network
//! node that synchronizes the directory with peers.

pub mod config;
pub mod directory;
pub mod error;
pub mod event_bus;
pub mod platform;
pub mod router;
pub mod supervisor;

pub use config::load_config;
pub use directory::MemoryDirectory;
pub use error::{KernelError, KernelResult};
pub use event_bus::EventBus;
pub use platform::Platform;
pub use router::LocalRouter;
pub use supervisor::Supervisor;
