/// 协议适配器实现模块
///
/// QUIC 加密配置：服务端证书来源与客户端证书校验

pub mod quic;

pub use quic::{ProofSource, ProofVerifier};
