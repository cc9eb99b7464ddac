/// 会话层：QUIC 连接会话、流适配器以及面向应用的句柄
///
/// `QuicTransportSession` 与 `StreamAdapter` 只存在于 I/O 线程（`!Send`），
/// 应用通过可跨线程克隆的 `SessionHandle` / `StreamHandle` 操作它们。

pub mod handle;
pub mod quic_transport_session;
pub mod stream;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::event::Listener;
use crate::transport::runner::TaskRunner;

pub use handle::{SessionHandle, StreamHandle};
pub use quic_transport_session::{SessionState, StreamRefusal};
pub use stream::Directionality;

pub(crate) use quic_transport_session::{QuicTransportSession, SessionSignal};

/// 连接标识，由 QUIC 引擎在端点内分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) quinn_proto::ConnectionHandle);

impl ConnectionId {
    pub fn as_usize(&self) -> usize {
        self.0 .0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0 .0)
    }
}

/// 连接统计快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub remote_address: Option<SocketAddr>,
    pub rtt: Duration,
    pub congestion_window: u64,
    pub lost_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub open_streams: usize,
}

impl ConnectionStats {
    pub(crate) fn from_quinn(
        stats: &quinn_proto::ConnectionStats,
        remote_address: SocketAddr,
        open_streams: usize,
    ) -> Self {
        Self {
            remote_address: Some(remote_address),
            rtt: stats.path.rtt,
            congestion_window: stats.path.cwnd,
            lost_packets: stats.path.lost_packets,
            bytes_sent: stats.udp_tx.bytes,
            bytes_received: stats.udp_rx.bytes,
            datagrams_sent: stats.udp_tx.datagrams,
            datagrams_received: stats.udp_rx.datagrams,
            open_streams,
        }
    }
}

/// Per-session policy derived from the server or client configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub respect_goaway: bool,
    pub max_buffered_bytes_per_stream: usize,
    pub keep_alive_interval: Option<Duration>,
    /// Client only: close the session if the handshake is not done by then.
    pub handshake_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            respect_goaway: false,
            max_buffered_bytes_per_stream: 1024 * 1024,
            keep_alive_interval: None,
            handshake_timeout: None,
        }
    }
}

/// What every session on one I/O thread shares: the two runners and the
/// integer-handle listener.
#[derive(Clone)]
pub(crate) struct SessionEnv {
    pub io: Arc<TaskRunner>,
    pub events: Arc<TaskRunner>,
    pub listener: Rc<RefCell<Option<Arc<dyn Listener>>>>,
}

impl SessionEnv {
    pub fn new(io: Arc<TaskRunner>, events: Arc<TaskRunner>) -> Self {
        Self {
            io,
            events,
            listener: Rc::new(RefCell::new(None)),
        }
    }

    pub fn listener(&self) -> Option<Arc<dyn Listener>> {
        self.listener.borrow().clone()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn Listener>>) {
        *self.listener.borrow_mut() = listener;
    }

    /// Hand a notification to the event thread; never runs it here.
    pub fn post_event<F>(&self, notification: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.events.post(notification) {
            tracing::debug!("[WARN] event runner stopped, notification dropped");
        }
    }

    pub fn notify_listener<F>(&self, notification: F)
    where
        F: FnOnce(&dyn Listener) + Send + 'static,
    {
        if let Some(listener) = self.listener() {
            self.post_event(move || notification(&*listener));
        }
    }
}
