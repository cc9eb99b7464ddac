use crate::protocol::ConfigError;

/// 应用层错误码，用于 CONNECTION_CLOSE / RESET_STREAM / STOP_SENDING
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const INTERNAL_ERROR: u32 = 0x1;
    /// Peer opened a stream in a namespace it does not own.
    pub const INVALID_STREAM_ID: u32 = 0x2;
    pub const STREAM_REFUSED: u32 = 0x3;
    pub const HANDSHAKE_TIMEOUT: u32 = 0x4;
    pub const SERVER_SHUTDOWN: u32 = 0x5;
}

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 正常关闭
    Normal,
    /// 超时
    Timeout,
    /// 错误
    Error(String),
    /// 被强制关闭
    Forced,
    /// 应用层错误码关闭
    Application { code: u64, reason: String },
}

impl CloseReason {
    /// Classify why quinn-proto reported the connection lost.
    pub fn from_connection_error(error: &quinn_proto::ConnectionError) -> Self {
        use quinn_proto::ConnectionError;
        match error {
            ConnectionError::TimedOut => CloseReason::Timeout,
            ConnectionError::LocallyClosed => CloseReason::Normal,
            ConnectionError::Reset => CloseReason::Forced,
            ConnectionError::ApplicationClosed(close) => {
                let code = close.error_code.into_inner();
                if code == u64::from(error_code::NO_ERROR) {
                    CloseReason::Normal
                } else {
                    CloseReason::Application {
                        code,
                        reason: String::from_utf8_lossy(&close.reason).into_owned(),
                    }
                }
            }
            other => CloseReason::Error(other.to_string()),
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, CloseReason::Normal)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
            CloseReason::Forced => write!(f, "forced"),
            CloseReason::Application { code, reason } => {
                write!(f, "application error {:#x}: {}", code, reason)
            }
        }
    }
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection { reason: String, retryable: bool },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol { protocol: String, reason: String },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
        }
    }
}

/// 便利构造函数
impl TransportError {
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::AddrInUse
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        let field = match &error {
            ConfigError::InvalidAddress { address, .. } => address.clone(),
            ConfigError::InvalidValue { field, .. } => field.clone(),
            ConfigError::MissingRequiredField { field, .. } => field.clone(),
            ConfigError::FileNotFound { path, .. } => path.clone(),
            ConfigError::Io(_) => "io".to_string(),
            ConfigError::Parse(_) => "format".to_string(),
        };
        TransportError::config_error(field, error.to_string())
    }
}

/// QUIC 引擎及 TLS 层错误
#[derive(Debug, thiserror::Error)]
pub enum QuicError {
    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn_proto::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn_proto::ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<QuicError> for TransportError {
    fn from(error: QuicError) -> Self {
        match error {
            QuicError::Connect(e) => {
                TransportError::connection_error(format!("QUIC connect failed: {}", e), false)
            }
            QuicError::Connection(e) => {
                TransportError::connection_error(format!("QUIC connection error: {}", e), true)
            }
            QuicError::Tls(e) => TransportError::config_error("tls", format!("TLS error: {}", e)),
            QuicError::Io(e) => e.into(),
            QuicError::Certificate(msg) => TransportError::config_error("certificate", msg),
            QuicError::Config(msg) => TransportError::config_error("quic", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_close_maps_to_reason() {
        let close = quinn_proto::ApplicationClose {
            error_code: quinn_proto::VarInt::from_u32(error_code::INVALID_STREAM_ID),
            reason: bytes::Bytes::from_static(b"bad stream"),
        };
        let reason =
            CloseReason::from_connection_error(&quinn_proto::ConnectionError::ApplicationClosed(close));
        assert_eq!(
            reason,
            CloseReason::Application {
                code: u64::from(error_code::INVALID_STREAM_ID),
                reason: "bad stream".to_string()
            }
        );
    }

    #[test]
    fn test_no_error_close_is_normal() {
        let close = quinn_proto::ApplicationClose {
            error_code: quinn_proto::VarInt::from_u32(error_code::NO_ERROR),
            reason: bytes::Bytes::new(),
        };
        let reason =
            CloseReason::from_connection_error(&quinn_proto::ConnectionError::ApplicationClosed(close));
        assert!(reason.is_normal());
        assert_eq!(
            CloseReason::from_connection_error(&quinn_proto::ConnectionError::TimedOut),
            CloseReason::Timeout
        );
    }

    #[test]
    fn test_error_codes_and_retry() {
        let err = TransportError::connection_error("stream refused", false);
        assert!(err.to_string().contains("stream refused"));
        assert!(!err.is_retryable());
        assert_eq!(err.error_code(), "CONNECTION_ERROR");
        assert_eq!(TransportError::config_error("client", "already started").error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_io_error_retryable() {
        let err: TransportError = std::io::Error::from(std::io::ErrorKind::AddrInUse).into();
        assert!(err.is_retryable());
    }
}
