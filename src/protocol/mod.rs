/// Protocol configuration layer
///
/// Serde-backed configuration for the QUIC server and client, validated before use.

pub mod adapter;
pub mod client_config;
pub mod server_config;

pub use adapter::{ConfigError, ProtocolConfig};
pub use client_config::QuicClientConfig;
pub use server_config::QuicServerConfig;
