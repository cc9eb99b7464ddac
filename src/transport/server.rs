/// QUIC 服务端
///
/// 拥有一个 I/O 线程（socket、端点、会话）和一个事件线程（访问者回调）。
/// 所有公开方法都可以在任意线程调用，包括在访问者回调内部。
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use quinn_proto::Side;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::dispatcher::{server_endpoint, Dispatcher};
use super::io_loop;
use super::packet_writer::UdpPacketWriter;
use super::runner::{set_local_state, take_local_state, with_local_state, TaskRunner};
use crate::adapters::ProofSource;
use crate::error::TransportError;
use crate::event::{Listener, ServerVisitor};
use crate::protocol::QuicServerConfig;
use crate::session::{SessionEnv, SessionHandle, SessionOptions};
use crate::{Result, SessionId};

pub struct QuicServer {
    config: QuicServerConfig,
    proof_source: ProofSource,
    io: Arc<TaskRunner>,
    events: Arc<TaskRunner>,
    visitor: Mutex<Option<Arc<dyn ServerVisitor>>>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

fn runner_stopped() -> TransportError {
    TransportError::connection_error("I/O runner stopped", false)
}

impl QuicServer {
    /// Spawns both worker threads. The proof source is resolved by the caller,
    /// so a certificate problem never produces a server object.
    pub(crate) fn new(config: QuicServerConfig, proof_source: ProofSource, instance: usize) -> Result<Self> {
        let io = TaskRunner::spawn_with_runtime(&format!("quic-server-io-{}", instance))?;
        let events = TaskRunner::spawn(&format!("quic-server-events-{}", instance))?;
        Ok(Self {
            config,
            proof_source,
            io,
            events,
            visitor: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &QuicServerConfig {
        &self.config
    }

    /// Must be set before `listen` to see the sessions it accepts.
    pub fn set_visitor(&self, visitor: Arc<dyn ServerVisitor>) {
        *self.visitor.lock() = Some(visitor.clone());
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.set_server_visitor(Some(visitor)));
        });
    }

    pub fn set_listener(&self, listener: Arc<dyn Listener>) {
        *self.listener.lock() = Some(listener.clone());
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.set_listener(Some(listener)));
        });
    }

    /// Bind `port` (0 picks an ephemeral port) on the configured address and start
    /// accepting. Blocks until the socket is bound; returns the bound port.
    pub fn listen(&self, port: u16) -> Result<u16> {
        let config = self.config.clone();
        let server_config = self.proof_source.server_config(&config)?;
        let visitor = self.visitor.lock().clone();
        let listener = self.listener.lock().clone();
        let (io, events) = (self.io.clone(), self.events.clone());

        self.io
            .invoke(move || -> Result<u16> {
                if with_local_state::<Dispatcher, _>(|_| ()).is_some() {
                    return Err(TransportError::config_error("server", "server is already listening"));
                }
                let bind_address = SocketAddr::new(config.bind_address.ip(), port);
                let std_socket = std::net::UdpSocket::bind(bind_address).map_err(|e| {
                    tracing::error!("[ERROR] failed to bind {}: {}", bind_address, e);
                    e
                })?;
                std_socket.set_nonblocking(true)?;
                let socket = Rc::new(UdpSocket::from_std(std_socket)?);
                let local_addr = socket.local_addr()?;

                let env = SessionEnv::new(io, events);
                env.set_listener(listener);
                let wake = Rc::new(Notify::new());
                let mut dispatcher = Dispatcher::new(
                    Side::Server,
                    server_endpoint(server_config),
                    local_addr,
                    Box::new(UdpPacketWriter::new(socket.clone())),
                    env,
                    SessionOptions {
                        respect_goaway: config.respect_goaway,
                        max_buffered_bytes_per_stream: config.max_buffered_bytes_per_stream,
                        keep_alive_interval: config.keep_alive_interval,
                        handshake_timeout: None,
                    },
                    wake.clone(),
                );
                dispatcher.set_max_sessions(config.max_sessions);
                dispatcher.set_max_reads_per_iteration(config.max_reads_per_iteration);
                dispatcher.set_server_visitor(visitor);

                set_local_state(dispatcher);
                tokio::task::spawn_local(io_loop::run(socket, wake));
                tracing::info!("[START] QUIC server listening on {}", local_addr);
                Ok(local_addr.port())
            })
            .ok_or_else(runner_stopped)?
    }

    /// Bound port, or 0 when not listening.
    pub fn server_port(&self) -> u16 {
        self.io
            .invoke(|| with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.local_addr().port()))
            .flatten()
            .unwrap_or(0)
    }

    pub fn is_listening(&self) -> bool {
        self.server_port() != 0
    }

    /// Close every session and release the socket. The server may `listen` again.
    pub fn stop(&self) {
        let stopped = self.io.invoke(|| {
            with_local_state::<Dispatcher, _>(Dispatcher::shutdown);
            take_local_state::<Dispatcher>().is_some()
        });
        if stopped == Some(true) {
            tracing::info!("[STOP] QUIC server stopped");
        }
    }

    /// Write to a stream by integer ids without waiting. A stream id equal to
    /// the next locally opened stream creates that stream.
    pub fn send(&self, session_id: SessionId, stream_id: u32, data: &[u8]) -> bool {
        let data = data.to_vec();
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.send(session_id, stream_id, &data));
        })
    }

    pub fn session(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.io
            .invoke(move || with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.session_handle(session_id)))
            .flatten()
            .flatten()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.io
            .invoke(|| with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.session_ids()))
            .flatten()
            .unwrap_or_default()
    }
}

impl Drop for QuicServer {
    fn drop(&mut self) {
        self.stop();
        self.io.stop();
        self.events.stop();
    }
}

impl std::fmt::Debug for QuicServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicServer")
            .field("bind_address", &self.config.bind_address)
            .field("io", &self.io)
            .finish()
    }
}
