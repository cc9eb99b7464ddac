/// 连接分发器
///
/// 每个 I/O 线程一个分发器：持有 QUIC 端点、会话表以及连接标识到会话 ID 的映射，
/// 把收到的数据包路由给对应会话，并在会话创建/关闭时通知访问者。
/// 分发器只在 I/O 线程上被访问，所以会话表不需要任何锁。
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use quinn_proto::{ConnectionHandle, DatagramEvent, Endpoint, EndpointConfig, Incoming, Side, Transmit};
use tokio::sync::Notify;

use super::packet_writer::PacketWriter;
use crate::error::{error_code, QuicError};
use crate::event::{ClientVisitor, Listener, ServerVisitor};
use crate::session::handle::stream_id_from_u32;
use crate::session::{
    ConnectionId, QuicTransportSession, SessionEnv, SessionHandle, SessionOptions, SessionSignal,
};
use crate::SessionId;

pub(crate) fn server_endpoint(config: quinn_proto::ServerConfig) -> Endpoint {
    Endpoint::new(
        Arc::new(EndpointConfig::default()),
        Some(Arc::new(config)),
        true,
        None,
    )
}

pub(crate) fn client_endpoint() -> Endpoint {
    Endpoint::new(Arc::new(EndpointConfig::default()), None, true, None)
}

fn write_transmit(writer: &dyn PacketWriter, transmit: &Transmit, buffer: &[u8]) {
    let payload = &buffer[..transmit.size];
    let segment = transmit.segment_size.unwrap_or(transmit.size).max(1);
    for packet in payload.chunks(segment) {
        if let Err(e) = writer.write_packet(transmit.destination, packet) {
            tracing::warn!("[SEND] failed to send {} bytes to {}: {}", packet.len(), transmit.destination, e);
        }
    }
}

pub(crate) struct Dispatcher {
    role: Side,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    writer: Box<dyn PacketWriter>,
    sessions: HashMap<SessionId, QuicTransportSession>,
    connection_ids: HashMap<ConnectionHandle, SessionId>,
    next_session_id: SessionId,
    client_config: Option<quinn_proto::ClientConfig>,
    options: SessionOptions,
    env: SessionEnv,
    server_visitor: Option<Arc<dyn ServerVisitor>>,
    client_visitor: Option<Arc<dyn ClientVisitor>>,
    open_stream_on_connect: bool,
    max_sessions: usize,
    max_reads_per_iteration: usize,
    send_buffer: Vec<u8>,
    wake: Rc<Notify>,
    shut_down: bool,
}

impl Dispatcher {
    pub fn new(
        role: Side,
        endpoint: Endpoint,
        local_addr: SocketAddr,
        writer: Box<dyn PacketWriter>,
        env: SessionEnv,
        options: SessionOptions,
        wake: Rc<Notify>,
    ) -> Self {
        tracing::info!("[START] {:?} dispatcher on {}", role, local_addr);
        Self {
            role,
            endpoint,
            local_addr,
            writer,
            sessions: HashMap::new(),
            connection_ids: HashMap::new(),
            next_session_id: SessionId::new(1),
            client_config: None,
            options,
            env,
            server_visitor: None,
            client_visitor: None,
            open_stream_on_connect: false,
            max_sessions: usize::MAX,
            max_reads_per_iteration: 32,
            send_buffer: Vec::with_capacity(1500),
            wake,
            shut_down: false,
        }
    }

    pub fn set_max_sessions(&mut self, max_sessions: usize) {
        self.max_sessions = max_sessions;
    }

    pub fn set_max_reads_per_iteration(&mut self, max_reads: usize) {
        self.max_reads_per_iteration = max_reads.max(1);
    }

    pub fn max_reads_per_iteration(&self) -> usize {
        self.max_reads_per_iteration
    }

    pub fn set_client_config(&mut self, config: quinn_proto::ClientConfig) {
        self.client_config = Some(config);
    }

    pub fn set_open_stream_on_connect(&mut self, open: bool) {
        self.open_stream_on_connect = open;
    }

    pub fn set_server_visitor(&mut self, visitor: Option<Arc<dyn ServerVisitor>>) {
        self.server_visitor = visitor;
    }

    pub fn set_client_visitor(&mut self, visitor: Option<Arc<dyn ClientVisitor>>) {
        self.client_visitor = visitor;
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn Listener>>) {
        self.env.set_listener(listener);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn session_handle(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(QuicTransportSession::handle)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut QuicTransportSession> {
        self.sessions.get_mut(&id)
    }

    /// Number of entries in the connection-id table; always equals `session_count`.
    pub fn registered_connections(&self) -> usize {
        self.connection_ids.len()
    }

    /// Route one received UDP payload.
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        let mut response = Vec::new();
        match self.endpoint.handle(now, remote, None, None, data, &mut response) {
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                let Some(id) = self.connection_ids.get(&handle).copied() else {
                    tracing::debug!("[RECV] packet for unknown connection {:?}", handle);
                    return;
                };
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.connection_mut().handle_event(event);
                }
                self.drive(id, now);
            }
            Some(DatagramEvent::NewConnection(incoming)) => self.accept(incoming, now),
            Some(DatagramEvent::Response(transmit)) => {
                write_transmit(&*self.writer, &transmit, &response);
            }
            None => {}
        }
    }

    fn accept(&mut self, incoming: Incoming, now: Instant) {
        let remote = incoming.remote_address();
        if self.shut_down || self.sessions.len() >= self.max_sessions {
            tracing::warn!(
                "[WARN] refusing connection from {} ({} sessions, limit {})",
                remote,
                self.sessions.len(),
                self.max_sessions
            );
            let mut response = Vec::new();
            let transmit = self.endpoint.refuse(incoming, &mut response);
            write_transmit(&*self.writer, &transmit, &response);
            return;
        }

        let mut response = Vec::new();
        match self.endpoint.accept(incoming, now, &mut response, None) {
            Ok((handle, connection)) => {
                tracing::info!("[START] accepted connection from {}", remote);
                let id = self.create_session(handle, connection, now);
                self.drive(id, now);
            }
            Err(e) => {
                tracing::warn!("[WARN] failed to accept {}: {}", remote, e.cause);
                if let Some(transmit) = e.response {
                    write_transmit(&*self.writer, &transmit, &response);
                }
            }
        }
    }

    /// Wrap a new connection in a session, initialize it, register it and tell the visitor.
    fn create_session(
        &mut self,
        handle: ConnectionHandle,
        connection: quinn_proto::Connection,
        now: Instant,
    ) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id = id.next();

        let mut session =
            QuicTransportSession::new(id, handle, connection, self.options.clone(), self.env.clone());
        session.initialize();
        session.start_handshake(now);

        if let Some(existing) = self.connection_ids.insert(handle, id) {
            // quinn-proto never reuses a live handle
            tracing::error!("[ERROR] connection {:?} already mapped to {}", handle, existing);
        }
        let session_handle = session.handle();
        self.sessions.insert(id, session);

        if let Some(visitor) = self.server_visitor.clone() {
            self.env.post_event(move || visitor.on_session(session_handle));
        }
        id
    }

    /// Open a client connection to `remote`.
    pub fn connect(&mut self, now: Instant, remote: SocketAddr, server_name: &str) -> Result<SessionId, QuicError> {
        let config = self
            .client_config
            .clone()
            .ok_or_else(|| QuicError::Config("client configuration missing".to_string()))?;
        let (handle, connection) = self.endpoint.connect(now, config, remote, server_name)?;
        tracing::info!("[START] connecting to {} ({})", remote, server_name);
        let id = self.create_session(handle, connection, now);
        self.drive(id, now);
        self.wake.notify_one();
        Ok(id)
    }

    /// Run everything a session has pending: application events, endpoint
    /// bookkeeping, outgoing packets and stream reclamation.
    pub fn drive(&mut self, id: SessionId, now: Instant) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let handle = session.connection_handle();

        session.process_events();
        while let Some(event) = session.connection_mut().poll_endpoint_events() {
            if let Some(event) = self.endpoint.handle_event(handle, event) {
                session.connection_mut().handle_event(event);
            }
        }
        // Handling endpoint events can queue more application events.
        session.process_events();

        loop {
            self.send_buffer.clear();
            match session.connection_mut().poll_transmit(now, 1, &mut self.send_buffer) {
                Some(transmit) => write_transmit(&*self.writer, &transmit, &self.send_buffer),
                None => break,
            }
        }

        session.reclaim_streams();
        let signals = session.take_signals();
        let drained = session.connection().is_drained();

        for signal in signals {
            self.on_session_signal(id, signal);
        }
        if drained {
            self.on_connection_closed(ConnectionId(handle));
        }
    }

    fn on_session_signal(&mut self, id: SessionId, signal: SessionSignal) {
        match signal {
            SessionSignal::Connected => {
                if self.role.is_client() {
                    if let (Some(visitor), Some(session)) = (self.client_visitor.clone(), self.session_handle(id)) {
                        self.env.post_event(move || visitor.on_connected(session));
                    }
                    if self.open_stream_on_connect {
                        let opened = self
                            .sessions
                            .get_mut(&id)
                            .and_then(QuicTransportSession::create_outgoing_bidirectional_stream);
                        if opened.is_none() {
                            tracing::warn!("[WARN] {} could not open the initial stream", id);
                        }
                    }
                }
            }
            SessionSignal::Closed { reason, during_handshake } => {
                tracing::info!("[CLOSE] {} closed: {}", id, reason);
                if self.role.is_client() && during_handshake {
                    if let Some(visitor) = self.client_visitor.clone() {
                        self.env.post_event(move || visitor.on_connection_failed(&reason));
                    }
                }
            }
        }
    }

    /// Remove a drained connection from both tables and notify.
    ///
    /// An id that is not registered is logged and ignored.
    pub fn on_connection_closed(&mut self, connection_id: ConnectionId) {
        let Some(id) = self.connection_ids.remove(&connection_id.0) else {
            tracing::warn!("[WARN] close for unregistered connection {}", connection_id);
            return;
        };
        let session = self.sessions.remove(&id);
        if session.is_none() {
            tracing::error!("[ERROR] {} mapped but missing from the session table", id);
        }
        drop(session);

        tracing::debug!("[CLOSE] {} removed ({})", id, connection_id);
        if let Some(visitor) = self.server_visitor.clone() {
            self.env.post_event(move || visitor.on_session_closed(id, connection_id));
        }
        self.env.notify_listener(move |listener| listener.on_session_closed(id));
    }

    /// Earliest instant any session needs `handle_timeout`.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.sessions.values_mut().filter_map(QuicTransportSession::poll_timeout).min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut due = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.poll_timeout().map_or(false, |deadline| deadline <= now) {
                due.push(*id);
            }
        }
        for id in due {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.handle_timeout(now);
            }
            self.drive(id, now);
        }
    }

    /// Drive every session; used after work that did not come from a packet or timer.
    pub fn drive_all(&mut self, now: Instant) {
        for id in self.session_ids() {
            self.drive(id, now);
        }
    }

    /// Run an application operation against a live session, then flush what it produced.
    pub fn session_op<R>(&mut self, id: SessionId, op: impl FnOnce(&mut QuicTransportSession) -> R) -> Option<R> {
        let session = self.sessions.get_mut(&id)?;
        let result = op(session);
        self.drive(id, Instant::now());
        // Deadlines may have moved.
        self.wake.notify_one();
        Some(result)
    }

    /// Integer-handle write: opens the stream lazily when `stream_id` is the next local id.
    pub fn send(&mut self, session_id: SessionId, stream_id: u32, data: &[u8]) -> bool {
        let stream_id = stream_id_from_u32(stream_id);
        self.session_op(session_id, |session| match session.get_or_create_stream(stream_id) {
            Some(id) => session.stream_write(id, data, false) == data.len(),
            None => false,
        })
        .unwrap_or_else(|| {
            tracing::debug!("[WARN] send to unknown {}", session_id);
            false
        })
    }

    /// Close every session and forget them. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let (code, reason) = match self.role {
            Side::Server => (error_code::SERVER_SHUTDOWN, "server shutting down"),
            Side::Client => (error_code::NO_ERROR, "client stopped"),
        };
        tracing::info!("[STOP] dispatcher on {} closing {} sessions", self.local_addr, self.sessions.len());

        let now = Instant::now();
        for id in self.session_ids() {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.close_connection(code, reason);
            }
            self.drive(id, now);
        }
        let remaining: Vec<ConnectionHandle> = self.connection_ids.keys().copied().collect();
        for handle in remaining {
            self.on_connection_closed(ConnectionId(handle));
        }

        if let Some(visitor) = self.server_visitor.clone() {
            self.env.post_event(move || visitor.on_ended());
        }
        self.wake.notify_one();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        tracing::debug!("[STOP] dispatcher on {} dropped", self.local_addr);
    }
}
