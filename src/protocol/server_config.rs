use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::adapter::{ConfigError, ProtocolConfig};

/// QUIC 服务端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicServerConfig {
    /// Bind address; the port is replaced by the one passed to `listen`
    pub bind_address: SocketAddr,
    /// Certificate chain file (PEM)
    pub cert_path: Option<PathBuf>,
    /// Private key file (PEM)
    pub key_path: Option<PathBuf>,
    /// Certificate chain PEM content, used when no path is given
    pub cert_pem: Option<String>,
    /// Private key PEM content, used when no path is given
    pub key_pem: Option<String>,
    /// Maximum idle timeout
    pub max_idle_timeout: Duration,
    /// Keep-alive ping interval, applied only while streams are open
    pub keep_alive_interval: Option<Duration>,
    /// Bidirectional streams a peer may keep open concurrently
    pub max_concurrent_bidi_streams: u32,
    /// Unidirectional streams a peer may keep open concurrently
    pub max_concurrent_uni_streams: u32,
    /// Maximum live sessions; further handshakes are refused
    pub max_sessions: usize,
    /// Bytes a stream may hold in its write buffer before `write` is refused
    pub max_buffered_bytes_per_stream: usize,
    /// Datagrams read per event-loop iteration before yielding
    pub max_reads_per_iteration: usize,
    /// Initial respect-goaway policy of new sessions
    pub respect_goaway: bool,
}

impl Default for QuicServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            cert_path: None,
            key_path: None,
            cert_pem: None,
            key_pem: None,
            max_idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            max_sessions: 10_000,
            max_buffered_bytes_per_stream: 1024 * 1024,
            max_reads_per_iteration: 32,
            respect_goaway: false,
        }
    }
}

impl ProtocolConfig for QuicServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_idle_timeout.is_zero() {
            return Err(ConfigError::must_be_positive(
                "max_idle_timeout",
                "0s",
                "set a timeout like 30s",
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::must_be_positive(
                "max_sessions",
                0,
                "set a positive value like 10000",
            ));
        }
        if self.max_buffered_bytes_per_stream == 0 {
            return Err(ConfigError::must_be_positive(
                "max_buffered_bytes_per_stream",
                0,
                "set a positive value like 1048576",
            ));
        }
        if self.max_reads_per_iteration == 0 {
            return Err(ConfigError::must_be_positive(
                "max_reads_per_iteration",
                0,
                "set a positive value like 32",
            ));
        }
        match (&self.cert_path, &self.key_path) {
            (Some(_), None) => {
                return Err(ConfigError::MissingRequiredField {
                    field: "key_path".to_string(),
                    suggestion: "provide the private key matching cert_path".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingRequiredField {
                    field: "cert_path".to_string(),
                    suggestion: "provide the certificate matching key_path".to_string(),
                })
            }
            _ => {}
        }
        if self.cert_pem.is_some() != self.key_pem.is_some() {
            return Err(ConfigError::MissingRequiredField {
                field: if self.cert_pem.is_some() { "key_pem" } else { "cert_pem" }.to_string(),
                suggestion: "provide both cert_pem and key_pem, or neither for a self-signed certificate"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

impl QuicServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从字符串设置绑定地址
    pub fn with_bind_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = addr.parse().map_err(|e| ConfigError::InvalidAddress {
            address: addr.to_string(),
            reason: format!("Invalid bind address: {}", e),
            source: Some(Box::new(e)),
        })?;
        Ok(self)
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// 设置证书和私钥文件
    pub fn with_cert_files(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    /// 设置 PEM 格式证书和私钥
    pub fn with_tls_pem(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.cert_pem = Some(cert_pem.into());
        self.key_pem = Some(key_pem.into());
        self
    }

    pub fn with_max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_max_concurrent_streams(mut self, bidi: u32, uni: u32) -> Self {
        self.max_concurrent_bidi_streams = bidi;
        self.max_concurrent_uni_streams = uni;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_max_buffered_bytes_per_stream(mut self, bytes: usize) -> Self {
        self.max_buffered_bytes_per_stream = bytes;
        self
    }

    pub fn with_max_reads_per_iteration(mut self, reads: usize) -> Self {
        self.max_reads_per_iteration = reads;
        self
    }

    pub fn with_respect_goaway(mut self, respect: bool) -> Self {
        self.respect_goaway = respect;
        self
    }

    /// 构建配置（包含验证）
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(QuicServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let mut config = QuicServerConfig::default();
        config.cert_path = Some(PathBuf::from("cert.pem"));
        match config.validate() {
            Err(ConfigError::MissingRequiredField { field, .. }) => assert_eq!(field, "key_path"),
            other => panic!("unexpected validation result: {:?}", other),
        }
    }

    #[test]
    fn test_zero_read_batch_is_rejected() {
        assert!(QuicServerConfig::new().with_max_reads_per_iteration(0).build().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = QuicServerConfig::from_json_str(r#"{ "max_sessions": 4, "respect_goaway": true }"#).unwrap();
        assert_eq!(config.max_sessions, 4);
        assert!(config.respect_goaway);
        assert_eq!(config.max_concurrent_bidi_streams, 100);
    }

    #[test]
    fn test_bad_bind_address() {
        assert!(matches!(
            QuicServerConfig::new().with_bind_str("not-an-address"),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }
}
