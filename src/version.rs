/// 版本信息

/// Crate version, e.g. `0.1.0`.
pub fn version_number() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Short description of the most recent behavioural change.
pub fn last_change() -> &'static str {
    "goaway datagram, handshake timeout and integer-handle listener"
}
