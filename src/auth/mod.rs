//! Upstream authentication: challenge parsing and the bearer-token broker
//! that completes the registry token dance on the client's behalf.

pub mod broker;
pub mod challenge;

pub use broker::TokenBroker;
pub use challenge::Challenge;
