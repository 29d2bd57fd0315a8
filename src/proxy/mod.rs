//! The reverse proxy: path grammar, forwarding engine, shared upstream
//! client, and the HTTP listener tying the surfaces together.

pub mod engine;
pub mod http_client;
pub mod path;
pub mod server;

pub use engine::ProxyEngine;
pub use path::{ParsedRequest, Route, RouteKind};
pub use server::ProxyServer;
