use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::adapter::{ConfigError, ProtocolConfig};

/// QUIC 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicClientConfig {
    /// 服务器名称（用于TLS验证）
    pub server_name: String,
    /// 证书验证
    pub verify_certificate: bool,
    /// 自定义CA证书PEM（可选）
    pub ca_cert_pem: Option<String>,
    /// 本地绑定地址（可选）
    pub local_bind_address: Option<SocketAddr>,
    /// 握手超时时间
    pub connect_timeout: Duration,
    /// 最大空闲超时
    pub max_idle_timeout: Duration,
    /// keepalive间隔
    pub keep_alive_interval: Option<Duration>,
    pub max_concurrent_bidi_streams: u32,
    pub max_concurrent_uni_streams: u32,
    pub max_buffered_bytes_per_stream: usize,
    pub max_reads_per_iteration: usize,
    /// 握手完成后自动打开一条双向流并回调 `Listener::on_ready`
    pub open_stream_on_connect: bool,
    pub respect_goaway: bool,
}

impl Default for QuicClientConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            verify_certificate: false,
            ca_cert_pem: None,
            local_bind_address: None,
            connect_timeout: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            max_buffered_bytes_per_stream: 1024 * 1024,
            max_reads_per_iteration: 32,
            open_stream_on_connect: false,
            respect_goaway: false,
        }
    }
}

impl ProtocolConfig for QuicClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "server_name".to_string(),
                suggestion: "set the TLS server name, e.g. \"localhost\"".to_string(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::must_be_positive("connect_timeout", "0s", "set a timeout like 10s"));
        }
        if self.max_idle_timeout.is_zero() {
            return Err(ConfigError::must_be_positive("max_idle_timeout", "0s", "set a timeout like 30s"));
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
        if self.ca_cert_pem.is_some() && !self.verify_certificate {
            return Err(ConfigError::InvalidValue {
                field: "ca_cert_pem".to_string(),
                value: "<pem>".to_string(),
                reason: "a custom CA has no effect while verify_certificate is false".to_string(),
                suggestion: "enable verify_certificate or drop ca_cert_pem".to_string(),
            });
        }
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

impl QuicClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务器名称（用于TLS验证）
    pub fn with_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = name.into();
        self
    }

    /// 设置证书验证
    pub fn with_verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    /// 设置自定义CA证书（隐含开启证书验证）
    pub fn with_ca_cert_pem<S: Into<String>>(mut self, ca_cert_pem: S) -> Self {
        self.ca_cert_pem = Some(ca_cert_pem.into());
        self.verify_certificate = true;
        self
    }

    pub fn with_local_bind_address(mut self, addr: SocketAddr) -> Self {
        self.local_bind_address = Some(addr);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
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

    pub fn with_max_buffered_bytes_per_stream(mut self, bytes: usize) -> Self {
        self.max_buffered_bytes_per_stream = bytes;
        self
    }

    pub fn with_open_stream_on_connect(mut self, open: bool) -> Self {
        self.open_stream_on_connect = open;
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
        assert!(QuicClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_server_name_is_rejected() {
        let result = QuicClientConfig::new().with_server_name("").build();
        assert!(matches!(result, Err(ConfigError::MissingRequiredField { .. })));
    }

    #[test]
    fn test_custom_ca_enables_verification() {
        let config = QuicClientConfig::new().with_ca_cert_pem("-----BEGIN CERTIFICATE-----");
        assert!(config.verify_certificate);
        assert!(config.validate().is_ok());
    }
}
