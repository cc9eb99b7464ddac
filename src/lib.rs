/// quicbridge - QUIC 会话与流生命周期层
///
/// 在 sans-IO 的 QUIC 状态机之上提供会话/流适配层：
/// 每个服务端或客户端实例拥有一个 I/O 线程（socket 与全部 QUIC 状态）
/// 和一个事件线程（访问者回调），两者之间只通过任务投递通信。
///
/// ```no_run
/// use quicbridge::{QuicServerConfig, QuicTransportFactory};
///
/// let factory = QuicTransportFactory::get()?;
/// let server = factory.create_server(QuicServerConfig::default())?;
/// let port = server.listen(0)?;
/// println!("listening on {}", port);
/// # Ok::<(), quicbridge::TransportError>(())
/// ```

// 传输层：执行器、分发器、服务端与客户端
pub mod transport;

// TLS 证书与校验
pub mod adapters;

// 配置
pub mod protocol;

// 会话与流
pub mod session;

// 核心类型
pub mod error;
pub mod event;
pub mod version;

/// 会话ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// 创建新的会话ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// 生成下一个会话ID
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<SessionId> for u32 {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

// 重新导出核心类型
pub use error::{error_code, CloseReason, QuicError, TransportError};
pub use event::{ClientVisitor, Listener, ServerVisitor, SessionVisitor, StreamVisitor};
pub use protocol::{ConfigError, ProtocolConfig, QuicClientConfig, QuicServerConfig};
pub use session::{
    ConnectionId, ConnectionStats, Directionality, SessionHandle, SessionState, StreamHandle, StreamRefusal,
};
pub use transport::{FactoryOptions, QuicClient, QuicServer, QuicTransportFactory};
pub use adapters::{ProofSource, ProofVerifier};

/// 便捷的结果类型
pub type Result<T> = std::result::Result<T, TransportError>;
