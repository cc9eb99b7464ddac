/// 访问者（回调）接口
///
/// 所有回调都在事件线程上执行，绝不会在 I/O 线程上调用，
/// 因此回调内部可以放心调用阻塞式句柄方法（如创建流、写数据）。
/// 所有方法都有空的默认实现，只需覆盖关心的事件。
use crate::error::CloseReason;
use crate::session::{ConnectionId, SessionHandle, StreamHandle};
use crate::SessionId;

/// 流级事件
pub trait StreamVisitor: Send + Sync {
    /// One contiguous region of newly readable bytes, in stream order.
    fn on_data(&self, _stream: &StreamHandle, _data: &[u8]) {}

    /// The peer finished its side; delivered exactly once, after the last `on_data`.
    fn on_fin_read(&self, _stream: &StreamHandle) {}

    /// The write buffer drained and the stream accepts writes again.
    fn on_can_write(&self, _stream: &StreamHandle) {}

    /// Both directions are done and the stream was reclaimed.
    fn on_closed(&self, _stream: &StreamHandle) {}
}

/// 会话级事件
pub trait SessionVisitor: Send + Sync {
    /// 对端打开了新流
    fn on_incoming_stream(&self, _session: &SessionHandle, _stream: StreamHandle) {}

    /// 握手完成或对端提高了流上限，可以尝试创建新的流
    fn on_can_create_new_stream(&self, _session: &SessionHandle, _unidirectional: bool) {}

    /// 收到对端 goaway
    fn on_goaway(&self, _session: &SessionHandle) {}

    fn on_stream_closed(&self, _session: &SessionHandle, _stream_id: u32) {}

    /// 连接关闭，之后该会话不再有任何回调
    fn on_connection_closed(&self, _session: &SessionHandle, _reason: &CloseReason) {}
}

/// 服务端事件
pub trait ServerVisitor: Send + Sync {
    /// 新会话已创建并初始化（握手可能尚未完成）
    fn on_session(&self, _session: SessionHandle) {}

    /// 会话已从分发表中移除
    fn on_session_closed(&self, _session_id: SessionId, _connection_id: ConnectionId) {}

    /// 服务端已停止
    fn on_ended(&self) {}
}

/// 客户端事件
pub trait ClientVisitor: Send + Sync {
    fn on_connected(&self, _session: SessionHandle) {}

    /// 握手失败或超时
    fn on_connection_failed(&self, _reason: &CloseReason) {}
}

/// 整数句柄风格的监听器，供只持有 (session_id, stream_id) 的调用方使用
pub trait Listener: Send + Sync {
    /// A stream became usable through `send` (accepted from the peer or opened locally).
    fn on_ready(&self, _session_id: SessionId, _stream_id: u32) {}

    /// Data for a stream that has no `StreamVisitor` of its own.
    fn on_data(&self, _session_id: SessionId, _stream_id: u32, _data: &[u8]) {}

    /// The peer finished a stream whose data went to this listener; once, after its last `on_data`.
    fn on_fin_read(&self, _session_id: SessionId, _stream_id: u32) {}

    fn on_stream_closed(&self, _session_id: SessionId, _stream_id: u32) {}

    fn on_session_closed(&self, _session_id: SessionId) {}
}
