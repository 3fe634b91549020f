pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod gate;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod relay_transport;
pub mod session;
pub mod storage;
