pub mod admin;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mirror;
pub mod monitoring;
pub mod proxy;
pub mod shutdown;
pub mod store;
pub mod traffic;

// Re-export commonly used types
pub use config::Config;
pub use error::{ProxyError, ProxyResult};
pub use mirror::{HealthState, Mirror, MirrorAuth, MirrorRegistry};
pub use proxy::{ProxyEngine, ProxyServer};
pub use shutdown::Shutdown;
pub use store::Store;
pub use traffic::{TrafficRecord, TrafficRecorder};
