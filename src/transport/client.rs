/// QUIC 客户端
///
/// 与服务端相同的双线程模型；一个客户端实例同一时刻只维护一个会话。
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use quinn_proto::Side;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::dispatcher::{client_endpoint, Dispatcher};
use super::factory::Resolver;
use super::io_loop;
use super::packet_writer::UdpPacketWriter;
use super::runner::{set_local_state, take_local_state, with_local_state, TaskRunner};
use crate::adapters::ProofVerifier;
use crate::error::TransportError;
use crate::event::{ClientVisitor, Listener};
use crate::protocol::QuicClientConfig;
use crate::session::{SessionEnv, SessionHandle, SessionOptions};
use crate::{Result, SessionId};

pub struct QuicClient {
    config: QuicClientConfig,
    verifier: ProofVerifier,
    resolver: Resolver,
    io: Arc<TaskRunner>,
    events: Arc<TaskRunner>,
    visitor: Mutex<Option<Arc<dyn ClientVisitor>>>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

impl QuicClient {
    pub(crate) fn new(config: QuicClientConfig, resolver: Resolver, instance: usize) -> Result<Self> {
        let verifier = ProofVerifier::from_config(&config)?;
        let io = TaskRunner::spawn_with_runtime(&format!("quic-client-io-{}", instance))?;
        let events = TaskRunner::spawn(&format!("quic-client-events-{}", instance))?;
        Ok(Self {
            config,
            verifier,
            resolver,
            io,
            events,
            visitor: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &QuicClientConfig {
        &self.config
    }

    pub fn set_visitor(&self, visitor: Arc<dyn ClientVisitor>) {
        *self.visitor.lock() = Some(visitor.clone());
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.set_client_visitor(Some(visitor)));
        });
    }

    pub fn set_listener(&self, listener: Arc<dyn Listener>) {
        *self.listener.lock() = Some(listener.clone());
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.set_listener(Some(listener)));
        });
    }

    /// Resolve `host`, bind a local socket and begin the handshake.
    ///
    /// Returns once the first packet is on its way; completion is reported
    /// through `ClientVisitor::on_connected` or `on_connection_failed`.
    pub fn start(&self, host: &str, port: u16) -> Result<SessionHandle> {
        let remote = self.resolver.resolve(host, port)?;
        let client_config = self.verifier.client_config(&self.config)?;
        let config = self.config.clone();
        let visitor = self.visitor.lock().clone();
        let listener = self.listener.lock().clone();
        let (io, events) = (self.io.clone(), self.events.clone());

        self.io
            .invoke(move || -> Result<SessionHandle> {
                if with_local_state::<Dispatcher, _>(|_| ()).is_some() {
                    return Err(TransportError::config_error("client", "client is already started"));
                }
                let bind_address = config.local_bind_address.unwrap_or_else(|| match remote {
                    SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
                    SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
                });
                let std_socket = std::net::UdpSocket::bind(bind_address)?;
                std_socket.set_nonblocking(true)?;
                let socket = Rc::new(UdpSocket::from_std(std_socket)?);
                let local_addr = socket.local_addr()?;

                let env = SessionEnv::new(io, events);
                env.set_listener(listener);
                let wake = Rc::new(Notify::new());
                let mut dispatcher = Dispatcher::new(
                    Side::Client,
                    client_endpoint(),
                    local_addr,
                    Box::new(UdpPacketWriter::new(socket.clone())),
                    env,
                    SessionOptions {
                        respect_goaway: config.respect_goaway,
                        max_buffered_bytes_per_stream: config.max_buffered_bytes_per_stream,
                        keep_alive_interval: config.keep_alive_interval,
                        handshake_timeout: Some(config.connect_timeout),
                    },
                    wake.clone(),
                );
                dispatcher.set_client_config(client_config);
                dispatcher.set_client_visitor(visitor);
                dispatcher.set_open_stream_on_connect(config.open_stream_on_connect);
                dispatcher.set_max_reads_per_iteration(config.max_reads_per_iteration);

                let session_id = dispatcher.connect(Instant::now(), remote, &config.server_name)?;
                let handle = dispatcher
                    .session_handle(session_id)
                    .ok_or_else(|| TransportError::connection_error("session closed during connect", true))?;

                set_local_state(dispatcher);
                tokio::task::spawn_local(io_loop::run(socket, wake));
                Ok(handle)
            })
            .ok_or_else(|| TransportError::connection_error("I/O runner stopped", false))?
    }

    /// The current session, if one is open.
    pub fn session(&self) -> Option<SessionHandle> {
        self.io
            .invoke(|| {
                with_local_state::<Dispatcher, _>(|dispatcher| {
                    let id = dispatcher.session_ids().into_iter().next()?;
                    dispatcher.session_handle(id)
                })
            })
            .flatten()
            .flatten()
    }

    /// Write to a stream by integer ids without waiting.
    pub fn send(&self, session_id: SessionId, stream_id: u32, data: &[u8]) -> bool {
        let data = data.to_vec();
        self.io.post(move || {
            with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.send(session_id, stream_id, &data));
        })
    }

    /// Close the session and release the socket. The client may `start` again.
    pub fn stop(&self) {
        let stopped = self.io.invoke(|| {
            with_local_state::<Dispatcher, _>(Dispatcher::shutdown);
            take_local_state::<Dispatcher>().is_some()
        });
        if stopped == Some(true) {
            tracing::info!("[STOP] QUIC client stopped");
        }
    }
}

impl Drop for QuicClient {
    fn drop(&mut self) {
        self.stop();
        self.io.stop();
        self.events.stop();
    }
}

impl std::fmt::Debug for QuicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicClient")
            .field("server_name", &self.config.server_name)
            .field("io", &self.io)
            .finish()
    }
}
