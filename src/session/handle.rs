/// 面向应用的会话/流句柄
///
/// 句柄可以跨线程克隆和传递。读操作与创建流会投递到 I/O 线程并阻塞等待结果；
/// 纯通知型操作（关闭、设置访问者）只投递不等待。会话已经销毁时操作静默失效。
use std::sync::Arc;

use quinn_proto::{Side, StreamId, VarInt};

use super::{ConnectionId, ConnectionStats, Directionality, SessionState, QuicTransportSession};
use crate::error::error_code;
use crate::event::{SessionVisitor, StreamVisitor};
use crate::transport::dispatcher::Dispatcher;
use crate::transport::runner::{with_local_state, TaskRunner};
use crate::SessionId;

/// Run `op` against a live session on the I/O thread and wait for the result.
fn invoke_session<R, F>(io: &TaskRunner, session_id: SessionId, op: F) -> Option<R>
where
    F: FnOnce(&mut QuicTransportSession) -> R + Send + 'static,
    R: Send + 'static,
{
    io.invoke(move || {
        with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.session_op(session_id, op)).flatten()
    })
    .flatten()
}

fn post_session<F>(io: &TaskRunner, session_id: SessionId, op: F)
where
    F: FnOnce(&mut QuicTransportSession) + Send + 'static,
{
    let posted = io.post(move || {
        with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.session_op(session_id, op));
    });
    if !posted {
        tracing::debug!("[WARN] {} I/O runner stopped, operation dropped", session_id);
    }
}

/// 会话句柄
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    connection_id: ConnectionId,
    side: Side,
    io: Arc<TaskRunner>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, connection_id: ConnectionId, side: Side, io: Arc<TaskRunner>) -> Self {
        Self {
            id,
            connection_id,
            side,
            io,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_server(&self) -> bool {
        self.side.is_server()
    }

    /// Replaces the previous visitor. Events that already happened (handshake
    /// done, incoming streams nobody heard about) are replayed to it.
    pub fn set_visitor(&self, visitor: Arc<dyn SessionVisitor>) {
        post_session(&self.io, self.id, move |session| session.set_visitor(visitor));
    }

    pub fn set_respect_goaway(&self, respect: bool) {
        post_session(&self.io, self.id, move |session| session.set_respect_goaway(respect));
    }

    /// Tell the peer to stop opening new streams.
    pub fn go_away(&self) {
        post_session(&self.io, self.id, |session| {
            session.go_away();
        });
    }

    pub fn close(&self) {
        post_session(&self.io, self.id, |session| {
            session.close_connection(error_code::NO_ERROR, "closed by application")
        });
    }

    pub fn close_with_error(&self, code: u32, reason: &str) {
        let reason = reason.to_string();
        post_session(&self.io, self.id, move |session| session.close_connection(code, &reason));
    }

    pub fn is_session_ready(&self) -> bool {
        invoke_session(&self.io, self.id, |session| session.is_session_ready()).unwrap_or(false)
    }

    pub fn state(&self) -> SessionState {
        invoke_session(&self.io, self.id, |session| session.state()).unwrap_or(SessionState::Closed)
    }

    pub fn should_create_outgoing_bidirectional_stream(&self) -> bool {
        invoke_session(&self.io, self.id, |session| {
            session.should_create_outgoing_bidirectional_stream()
        })
        .unwrap_or(false)
    }

    /// `None` when the session is not ready, draining, or out of stream credit.
    pub fn create_bidirectional_stream(&self) -> Option<StreamHandle> {
        invoke_session(&self.io, self.id, |session| session.create_outgoing_bidirectional_stream()).flatten()
    }

    /// Server sessions only.
    ///
    /// # Panics
    ///
    /// Panics when called on a client session.
    pub fn create_unidirectional_stream(&self) -> Option<StreamHandle> {
        assert!(
            self.side.is_server(),
            "{}: client sessions must not create outgoing unidirectional streams",
            self.id
        );
        invoke_session(&self.io, self.id, |session| session.create_outgoing_unidirectional_stream()).flatten()
    }

    pub fn stats(&self) -> Option<ConnectionStats> {
        invoke_session(&self.io, self.id, |session| session.stats())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("side", &self.side)
            .finish()
    }
}

/// 流句柄
#[derive(Clone)]
pub struct StreamHandle {
    session_id: SessionId,
    stream_id: StreamId,
    directionality: Directionality,
    io: Arc<TaskRunner>,
}

impl StreamHandle {
    pub(crate) fn new(
        session_id: SessionId,
        stream_id: StreamId,
        directionality: Directionality,
        io: Arc<TaskRunner>,
    ) -> Self {
        Self {
            session_id,
            stream_id,
            directionality,
            io,
        }
    }

    /// Integer stream id as seen on the wire.
    pub fn id(&self) -> u32 {
        stream_id_to_u32(self.stream_id)
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn directionality(&self) -> Directionality {
        self.directionality
    }

    /// Install the stream visitor; data that is already readable is delivered to it.
    pub fn set_visitor(&self, visitor: Arc<dyn StreamVisitor>) {
        let id = self.stream_id;
        post_session(&self.io, self.session_id, move |session| {
            session.set_stream_visitor(id, visitor)
        });
    }

    /// Buffer `data` for sending. Returns the number of bytes accepted:
    /// all of `data`, or 0 when the stream cannot take it.
    pub fn write(&self, data: &[u8]) -> usize {
        self.write_inner(data, false)
    }

    /// Like `write`, then finish the write side.
    pub fn write_with_fin(&self, data: &[u8]) -> usize {
        self.write_inner(data, true)
    }

    fn write_inner(&self, data: &[u8], fin: bool) -> usize {
        let id = self.stream_id;
        let data = data.to_vec();
        invoke_session(&self.io, self.session_id, move |session| session.stream_write(id, &data, fin))
            .unwrap_or(0)
    }

    /// Pull-mode read for streams without a visitor. Returns bytes copied into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let id = self.stream_id;
        let max_len = buf.len();
        let data = invoke_session(&self.io, self.session_id, move |session| session.stream_read(id, max_len))
            .unwrap_or_default();
        buf[..data.len()].copy_from_slice(&data);
        data.len()
    }

    pub fn can_write(&self) -> bool {
        let id = self.stream_id;
        invoke_session(&self.io, self.session_id, move |session| session.stream_can_write(id)).unwrap_or(false)
    }

    /// Finish the write side. Idempotent.
    pub fn close(&self) {
        let id = self.stream_id;
        post_session(&self.io, self.session_id, move |session| session.stream_close(id));
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.id())
            .field("directionality", &self.directionality)
            .finish()
    }
}

/// The integer handle for `id`, or `None` when it does not fit in 32 bits.
pub(crate) fn integer_stream_id(id: StreamId) -> Option<u32> {
    u32::try_from(VarInt::from(id).into_inner()).ok()
}

/// Sessions never create streams without an integer handle, so the fallback is not reached.
pub(crate) fn stream_id_to_u32(id: StreamId) -> u32 {
    integer_stream_id(id).unwrap_or_else(|| {
        tracing::warn!("[WARN] stream {} has no 32-bit handle", id);
        u32::MAX
    })
}

pub(crate) fn stream_id_from_u32(id: u32) -> StreamId {
    StreamId::from(VarInt::from_u32(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quinn_proto::Dir;

    #[test]
    fn test_stream_id_integer_conversion() {
        let id = StreamId::new(Side::Server, Dir::Uni, 5);
        let raw = stream_id_to_u32(id);
        assert_eq!(raw, 5 * 4 + 3);
        assert_eq!(stream_id_from_u32(raw), id);
    }

    #[test]
    fn test_stream_ids_beyond_32_bits_have_no_handle() {
        let last = StreamId::new(Side::Server, Dir::Uni, (u64::from(u32::MAX) - 3) / 4);
        assert_eq!(integer_stream_id(last), Some(u32::MAX));
        let beyond = StreamId::new(Side::Client, Dir::Bi, 1 << 30);
        assert_eq!(integer_stream_id(beyond), None);
    }

    #[test]
    fn test_handle_on_stopped_runner_is_inert() {
        let io = TaskRunner::spawn("test-inert-io").unwrap();
        io.stop();
        let stream = StreamHandle::new(
            SessionId::new(1),
            StreamId::new(Side::Client, Dir::Bi, 0),
            Directionality::Bidirectional,
            io.clone(),
        );
        assert_eq!(stream.write(b"hello"), 0);
        assert!(!stream.can_write());
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf), 0);
        stream.close();

        let session = SessionHandle::new(
            SessionId::new(1),
            ConnectionId(quinn_proto::ConnectionHandle(0)),
            Side::Client,
            io,
        );
        assert!(!session.is_session_ready());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.create_bidirectional_stream().is_none());
        assert!(session.stats().is_none());
    }

    #[test]
    fn test_handle_without_dispatcher_is_inert() {
        let io = TaskRunner::spawn("test-no-dispatcher").unwrap();
        let session = SessionHandle::new(
            SessionId::new(3),
            ConnectionId(quinn_proto::ConnectionHandle(0)),
            Side::Server,
            io,
        );
        assert!(session.create_unidirectional_stream().is_none());
        session.go_away();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
