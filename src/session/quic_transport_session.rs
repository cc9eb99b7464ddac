use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use quinn_proto::{Connection, ConnectionHandle, Dir, Event, Side, StreamEvent, StreamId, VarInt};

use super::handle::{integer_stream_id, SessionHandle, StreamHandle};
use super::stream::{Directionality, StreamAdapter};
use super::{ConnectionId, ConnectionStats, SessionEnv, SessionOptions};
use crate::error::{error_code, CloseReason};
use crate::event::{SessionVisitor, StreamVisitor};
use crate::SessionId;

/// Control datagram telling the peer to stop opening streams.
pub(crate) const GOAWAY_DATAGRAM: &[u8] = &[0x07];

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Created,
    Initialized,
    HandshakeInProgress,
    Active,
    /// Goaway received; no new outgoing streams.
    Draining,
    Closed,
}

/// 流创建被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamRefusal {
    #[error("connection is not connected")]
    NotConnected,
    #[error("encryption not established")]
    EncryptionNotEstablished,
    #[error("goaway received")]
    GoawayReceived,
    #[error("stream limit reached")]
    StreamLimitReached,
    #[error("stream id outside the peer's namespace")]
    InvalidStreamId,
}

/// Transitions the dispatcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    Connected,
    Closed {
        reason: CloseReason,
        during_handshake: bool,
    },
}

fn dir_index(dir: Dir) -> usize {
    match dir {
        Dir::Bi => 0,
        Dir::Uni => 1,
    }
}

/// 单个 QUIC 连接的会话（仅存在于 I/O 线程）
///
/// Owns the quinn-proto `Connection` by value, so it is released exactly once
/// when the session drops.
pub(crate) struct QuicTransportSession {
    id: SessionId,
    handle: ConnectionHandle,
    connection: Connection,
    side: Side,
    state: SessionState,
    encryption_established: bool,
    goaway_received: bool,
    respect_goaway: bool,
    streams: HashMap<StreamId, StreamAdapter>,
    /// Incoming streams no session visitor has heard about yet.
    unannounced: HashSet<StreamId>,
    /// Locally opened streams per direction, used to predict the next id.
    opened: [u64; 2],
    /// Last `open` failed for lack of credit; cleared by `StreamEvent::Available`.
    outgoing_blocked: [bool; 2],
    visitor: Option<Arc<dyn SessionVisitor>>,
    options: SessionOptions,
    env: SessionEnv,
    handshake_deadline: Option<Instant>,
    last_keep_alive: Instant,
    signals: Vec<SessionSignal>,
}

impl QuicTransportSession {
    pub fn new(
        id: SessionId,
        handle: ConnectionHandle,
        connection: Connection,
        options: SessionOptions,
        env: SessionEnv,
    ) -> Self {
        let side = connection.side();
        Self {
            id,
            handle,
            connection,
            side,
            state: SessionState::Created,
            encryption_established: false,
            goaway_received: false,
            respect_goaway: options.respect_goaway,
            streams: HashMap::new(),
            unannounced: HashSet::new(),
            opened: [0; 2],
            outgoing_blocked: [false; 2],
            visitor: None,
            options,
            env,
            handshake_deadline: None,
            last_keep_alive: Instant::now(),
            signals: Vec::new(),
        }
    }

    /// Must be called exactly once, before any stream operation.
    pub fn initialize(&mut self) {
        assert_eq!(
            self.state,
            SessionState::Created,
            "{} initialized twice",
            self.id
        );
        self.state = SessionState::Initialized;
        tracing::debug!("[START] {} initialized ({:?})", self.id, self.side);
    }

    /// The crypto handshake is under way (client: initial packet queued; server: first packet accepted).
    pub fn start_handshake(&mut self, now: Instant) {
        self.ensure_initialized();
        if self.state != SessionState::Initialized {
            return;
        }
        self.state = SessionState::HandshakeInProgress;
        if self.side.is_client() {
            self.handshake_deadline = self.options.handshake_timeout.map(|timeout| now + timeout);
        }
    }

    fn ensure_initialized(&self) {
        assert!(
            self.state != SessionState::Created,
            "{} used before initialize()",
            self.id
        );
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::HandshakeInProgress | SessionState::Active | SessionState::Draining
        ) && !self.connection.is_closed()
    }

    pub fn is_encryption_established(&self) -> bool {
        self.encryption_established
    }

    pub fn is_session_ready(&self) -> bool {
        self.is_connected() && self.encryption_established
    }

    pub fn goaway_received(&self) -> bool {
        self.goaway_received
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.id, ConnectionId(self.handle), self.side, self.env.io.clone())
    }

    fn stream_handle(&self, id: StreamId, directionality: Directionality) -> StreamHandle {
        StreamHandle::new(self.id, id, directionality, self.env.io.clone())
    }

    pub fn set_respect_goaway(&mut self, respect: bool) {
        self.respect_goaway = respect;
    }

    /// Install the session visitor and replay what it would otherwise have missed.
    pub fn set_visitor(&mut self, visitor: Arc<dyn SessionVisitor>) {
        self.visitor = Some(visitor);
        if self.state == SessionState::Active {
            self.notify_can_create(false);
            if self.side.is_server() {
                self.notify_can_create(true);
            }
        }
        let mut pending: Vec<StreamId> = self.unannounced.drain().collect();
        pending.sort_by_key(|id| VarInt::from(*id).into_inner());
        for id in pending {
            if let Some(stream) = self.streams.get(&id) {
                let handle = self.stream_handle(id, stream.directionality());
                self.announce_incoming(handle);
            }
        }
    }

    fn notify_session<F>(&self, notification: F)
    where
        F: FnOnce(&dyn SessionVisitor, &SessionHandle) + Send + 'static,
    {
        if let Some(visitor) = self.visitor.clone() {
            let session = self.handle();
            self.env.post_event(move || notification(&*visitor, &session));
        }
    }

    fn notify_can_create(&self, unidirectional: bool) {
        self.notify_session(move |visitor, session| {
            visitor.on_can_create_new_stream(session, unidirectional)
        });
    }

    fn announce_incoming(&mut self, stream: StreamHandle) {
        if self.visitor.is_some() {
            self.notify_session(move |visitor, session| visitor.on_incoming_stream(session, stream));
        } else {
            self.unannounced.insert(stream.stream_id());
        }
    }

    // ---- gating ----

    /// Connectivity, then encryption, then state, then stream credit.
    pub fn outgoing_stream_gate(&self, dir: Dir) -> Result<(), StreamRefusal> {
        self.ensure_initialized();
        if !self.is_connected() {
            return Err(StreamRefusal::NotConnected);
        }
        if !self.encryption_established {
            return Err(StreamRefusal::EncryptionNotEstablished);
        }
        if self.state != SessionState::Active {
            return Err(StreamRefusal::GoawayReceived);
        }
        let next = self.next_outgoing_stream_id(dir);
        if self.outgoing_blocked[dir_index(dir)] || integer_stream_id(next).is_none() {
            return Err(StreamRefusal::StreamLimitReached);
        }
        Ok(())
    }

    pub fn should_create_outgoing_bidirectional_stream(&self) -> bool {
        self.outgoing_stream_gate(Dir::Bi).is_ok()
    }

    /// A peer stream id outside the peer's namespace is a protocol violation and
    /// closes the connection. Goaway with respect-goaway is a soft refusal.
    pub fn should_create_incoming_stream(&mut self, id: StreamId) -> Result<(), StreamRefusal> {
        self.ensure_initialized();
        if !self.is_connected() {
            tracing::warn!("[WARN] {} incoming stream {} on a closed connection", self.id, id);
            return Err(StreamRefusal::NotConnected);
        }
        if id.initiator() == self.side {
            let reason = match self.side {
                Side::Server => "client created a server-initiated stream id",
                Side::Client => "server created a client-initiated stream id",
            };
            tracing::warn!("[SECURITY] {} {}: {}", self.id, reason, id);
            self.close_connection(error_code::INVALID_STREAM_ID, reason);
            return Err(StreamRefusal::InvalidStreamId);
        }
        if self.goaway_received && self.respect_goaway {
            tracing::debug!("[WARN] {} refusing stream {} after goaway", self.id, id);
            return Err(StreamRefusal::GoawayReceived);
        }
        if integer_stream_id(id).is_none() {
            tracing::warn!("[WARN] {} refusing stream {} beyond the 32-bit handle range", self.id, id);
            return Err(StreamRefusal::StreamLimitReached);
        }
        Ok(())
    }

    // ---- stream creation ----

    pub fn create_outgoing_bidirectional_stream(&mut self) -> Option<StreamHandle> {
        self.create_outgoing_stream(Dir::Bi)
    }

    /// Clients never originate unidirectional streams; asking for one is a bug.
    pub fn create_outgoing_unidirectional_stream(&mut self) -> Option<StreamHandle> {
        assert!(
            self.side.is_server(),
            "{}: client sessions must not create outgoing unidirectional streams",
            self.id
        );
        self.create_outgoing_stream(Dir::Uni)
    }

    fn create_outgoing_stream(&mut self, dir: Dir) -> Option<StreamHandle> {
        if let Err(refusal) = self.outgoing_stream_gate(dir) {
            tracing::debug!("[WARN] {} cannot open {:?} stream: {}", self.id, dir, refusal);
            return None;
        }
        let Some(id) = self.connection.streams().open(dir) else {
            self.outgoing_blocked[dir_index(dir)] = true;
            tracing::debug!("[WARN] {} {:?} stream limit reached", self.id, dir);
            return None;
        };
        self.opened[dir_index(dir)] += 1;

        let directionality = Directionality::of(id, self.side);
        self.streams.insert(
            id,
            StreamAdapter::new(id, directionality, self.options.max_buffered_bytes_per_stream),
        );
        let stream = self.stream_handle(id, directionality);
        let (session_id, stream_id) = (self.id, stream.id());
        self.env.notify_listener(move |listener| listener.on_ready(session_id, stream_id));
        tracing::debug!("[START] {} opened stream {}", self.id, id);
        Some(stream)
    }

    /// Id the next locally opened stream in `dir` will get.
    pub fn next_outgoing_stream_id(&self, dir: Dir) -> StreamId {
        StreamId::new(self.side, dir, self.opened[dir_index(dir)])
    }

    pub fn create_incoming_stream(&mut self, id: StreamId) -> Option<StreamHandle> {
        if self.streams.contains_key(&id) {
            tracing::warn!("[WARN] {} stream {} already exists", self.id, id);
            return None;
        }
        match self.should_create_incoming_stream(id) {
            Ok(()) => {}
            Err(StreamRefusal::InvalidStreamId) | Err(StreamRefusal::NotConnected) => return None,
            Err(_) => {
                StreamAdapter::reject(
                    &mut self.connection,
                    id,
                    self.side,
                    VarInt::from_u32(error_code::STREAM_REFUSED),
                );
                return None;
            }
        }

        let directionality = Directionality::of(id, self.side);
        self.streams.insert(
            id,
            StreamAdapter::new(id, directionality, self.options.max_buffered_bytes_per_stream),
        );
        let stream = self.stream_handle(id, directionality);
        tracing::debug!("[RECV] {} incoming stream {}", self.id, id);

        self.announce_incoming(stream.clone());
        let (session_id, stream_id) = (self.id, stream.id());
        self.env.notify_listener(move |listener| listener.on_ready(session_id, stream_id));

        // Data may have arrived together with the stream.
        self.deliver_readable(id);
        Some(stream)
    }

    /// Accept every stream quinn-proto has pending for `dir`.
    pub fn accept_pending_streams(&mut self, dir: Dir) {
        while let Some(id) = self.connection.streams().accept(dir) {
            self.create_incoming_stream(id);
            if self.state == SessionState::Closed {
                break;
            }
        }
    }

    /// Look up a stream, or open it when `id` is the next local id.
    pub fn get_or_create_stream(&mut self, id: StreamId) -> Option<StreamId> {
        if self.streams.contains_key(&id) {
            return Some(id);
        }
        if id.initiator() != self.side {
            tracing::warn!("[WARN] {} stream {} was never opened by the peer", self.id, id);
            return None;
        }
        let dir = id.dir();
        if dir == Dir::Uni && self.side.is_client() {
            tracing::warn!("[WARN] {} clients do not open unidirectional streams", self.id);
            return None;
        }
        if id != self.next_outgoing_stream_id(dir) {
            tracing::warn!(
                "[WARN] {} stream {} is not the next local stream ({})",
                self.id,
                id,
                self.next_outgoing_stream_id(dir)
            );
            return None;
        }
        self.create_outgoing_stream(dir).map(|stream| stream.stream_id())
    }

    // ---- stream operations ----

    pub fn stream_write(&mut self, id: StreamId, data: &[u8], fin: bool) -> usize {
        match self.streams.get_mut(&id) {
            Some(stream) => stream.write(&mut self.connection, data, fin),
            None => 0,
        }
    }

    pub fn stream_read(&mut self, id: StreamId, max_len: usize) -> Vec<u8> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Vec::new();
        };
        let outcome = stream.read_up_to(&mut self.connection, max_len);
        let fin = stream.take_fin_notification();
        let visitor = stream.visitor();
        let directionality = stream.directionality();

        if fin {
            let handle = self.stream_handle(id, directionality);
            match visitor {
                Some(visitor) => self.env.post_event(move || visitor.on_fin_read(&handle)),
                None => {
                    let (session_id, stream_id) = (self.id, handle.id());
                    self.env
                        .notify_listener(move |listener| listener.on_fin_read(session_id, stream_id));
                }
            }
        }
        let mut data = Vec::with_capacity(outcome.len());
        for region in &outcome.regions {
            data.extend_from_slice(region);
        }
        data
    }

    pub fn stream_close(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.close(&mut self.connection);
        }
    }

    pub fn stream_can_write(&self, id: StreamId) -> bool {
        self.streams.get(&id).map_or(false, StreamAdapter::can_write)
    }

    pub fn stream_buffered_bytes(&self, id: StreamId) -> usize {
        self.streams.get(&id).map_or(0, StreamAdapter::buffered_bytes)
    }

    pub fn set_stream_visitor(&mut self, id: StreamId, visitor: Arc<dyn StreamVisitor>) {
        match self.streams.get_mut(&id) {
            Some(stream) => stream.set_visitor(visitor),
            None => {
                tracing::debug!("[WARN] {} set_visitor on unknown stream {}", self.id, id);
                return;
            }
        }
        self.deliver_readable(id);
    }

    /// Push every readable region of `id` to its visitor (or the listener).
    ///
    /// With neither installed the bytes stay in the transport for `read`.
    fn deliver_readable(&mut self, id: StreamId) {
        let listener = self.env.listener();
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let visitor = stream.visitor();
        if visitor.is_none() && listener.is_none() {
            return;
        }

        let outcome = stream.drain(&mut self.connection);
        let fin = stream.take_fin_notification();
        let directionality = stream.directionality();
        if let Some(code) = outcome.reset {
            tracing::debug!("[CLOSE] {} stream {} reset by peer (code {})", self.id, id, code);
        }

        let handle = self.stream_handle(id, directionality);
        match visitor {
            Some(visitor) => {
                for region in outcome.regions {
                    let (visitor, handle) = (visitor.clone(), handle.clone());
                    self.env.post_event(move || visitor.on_data(&handle, &region));
                }
                if fin {
                    self.env.post_event(move || visitor.on_fin_read(&handle));
                }
            }
            None => {
                let (session_id, stream_id) = (self.id, handle.id());
                for region in outcome.regions {
                    self.env
                        .notify_listener(move |listener| listener.on_data(session_id, stream_id, &region));
                }
                if fin {
                    self.env
                        .notify_listener(move |listener| listener.on_fin_read(session_id, stream_id));
                }
            }
        }
    }

    fn on_stream_writable(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let drained = stream.flush(&mut self.connection);
        if !drained || !stream.can_write() {
            return;
        }
        let directionality = stream.directionality();
        if let Some(visitor) = stream.visitor() {
            let handle = self.stream_handle(id, directionality);
            self.env.post_event(move || visitor.on_can_write(&handle));
        }
    }

    /// Drop streams whose both sides are finished and tell everyone once.
    pub fn reclaim_streams(&mut self) {
        let done: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.is_reclaimable())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            if let Some(stream) = self.streams.remove(&id) {
                self.unannounced.remove(&id);
                self.notify_stream_closed(stream);
            }
        }
    }

    fn notify_stream_closed(&self, stream: StreamAdapter) {
        let handle = self.stream_handle(stream.id(), stream.directionality());
        let (session_id, stream_id) = (self.id, handle.id());
        tracing::trace!("[CLOSE] {} stream {} reclaimed", self.id, stream.id());
        if let Some(visitor) = stream.visitor() {
            let handle = handle.clone();
            self.env.post_event(move || visitor.on_closed(&handle));
        }
        self.notify_session(move |visitor, session| visitor.on_stream_closed(session, stream_id));
        self.env
            .notify_listener(move |listener| listener.on_stream_closed(session_id, stream_id));
    }

    // ---- connection-level ----

    /// Process everything quinn-proto has queued for the application.
    pub fn process_events(&mut self) {
        while let Some(event) = self.connection.poll() {
            match event {
                Event::HandshakeDataReady => {
                    tracing::trace!("[START] {} handshake data ready", self.id);
                }
                Event::Connected => self.on_handshake_complete(),
                Event::ConnectionLost { reason } => {
                    let reason = CloseReason::from_connection_error(&reason);
                    tracing::info!("[CLOSE] {} connection lost: {}", self.id, reason);
                    self.on_closed(reason);
                }
                Event::Stream(StreamEvent::Opened { dir }) => self.accept_pending_streams(dir),
                Event::Stream(StreamEvent::Readable { id }) => self.deliver_readable(id),
                Event::Stream(StreamEvent::Writable { id }) => self.on_stream_writable(id),
                Event::Stream(StreamEvent::Finished { id }) => {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.on_finished();
                    }
                }
                Event::Stream(StreamEvent::Stopped { id, error_code }) => {
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.on_stopped(error_code);
                    }
                }
                Event::Stream(StreamEvent::Available { dir }) => {
                    self.outgoing_blocked[dir_index(dir)] = false;
                    if self.state == SessionState::Active {
                        self.notify_can_create(dir == Dir::Uni);
                    }
                }
                Event::DatagramReceived => self.drain_datagrams(),
                Event::DatagramsUnblocked => {}
            }
        }
    }

    fn on_handshake_complete(&mut self) {
        self.encryption_established = true;
        self.handshake_deadline = None;
        if matches!(
            self.state,
            SessionState::Initialized | SessionState::HandshakeInProgress
        ) {
            self.state = SessionState::Active;
        }
        tracing::info!(
            "[SUCCESS] {} handshake complete with {}",
            self.id,
            self.connection.remote_address()
        );
        self.notify_can_create(false);
        if self.side.is_server() {
            self.notify_can_create(true);
        }
        self.signals.push(SessionSignal::Connected);
    }

    fn drain_datagrams(&mut self) {
        while let Some(datagram) = self.connection.datagrams().recv() {
            if datagram.as_ref() == GOAWAY_DATAGRAM {
                self.on_goaway_received();
            } else {
                tracing::trace!("[RECV] {} ignoring {}-byte datagram", self.id, datagram.len());
            }
        }
    }

    pub fn on_goaway_received(&mut self) {
        if self.goaway_received {
            return;
        }
        self.goaway_received = true;
        if self.state == SessionState::Active {
            self.state = SessionState::Draining;
        }
        tracing::info!("[CLOSE] {} goaway received", self.id);
        self.notify_session(|visitor, session| visitor.on_goaway(session));
    }

    /// Ask the peer to stop opening streams.
    pub fn go_away(&mut self) -> bool {
        match self
            .connection
            .datagrams()
            .send(Bytes::from_static(GOAWAY_DATAGRAM), false)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[WARN] {} cannot send goaway: {}", self.id, e);
                false
            }
        }
    }

    pub fn close_connection(&mut self, code: u32, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        self.connection.close(
            Instant::now(),
            VarInt::from_u32(code),
            Bytes::copy_from_slice(reason.as_bytes()),
        );
        let reason = if code == error_code::NO_ERROR {
            CloseReason::Normal
        } else {
            CloseReason::Application {
                code: u64::from(code),
                reason: reason.to_string(),
            }
        };
        self.on_closed(reason);
    }

    fn on_closed(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        let during_handshake = !self.encryption_established;
        self.state = SessionState::Closed;
        self.handshake_deadline = None;

        let mut streams: Vec<StreamAdapter> = self.streams.drain().map(|(_, stream)| stream).collect();
        streams.sort_by_key(|stream| VarInt::from(stream.id()).into_inner());
        self.unannounced.clear();
        for stream in streams {
            self.notify_stream_closed(stream);
        }

        let notified = reason.clone();
        self.notify_session(move |visitor, session| visitor.on_connection_closed(session, &notified));
        self.signals.push(SessionSignal::Closed {
            reason,
            during_handshake,
        });
    }

    pub fn take_signals(&mut self) -> Vec<SessionSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Exact: true while any stream is open or still draining.
    pub fn should_keep_connection_alive(&self) -> bool {
        !self.streams.is_empty()
    }

    fn keep_alive_deadline(&self) -> Option<Instant> {
        let interval = self.options.keep_alive_interval?;
        if self.state == SessionState::Active && self.should_keep_connection_alive() {
            Some(self.last_keep_alive + interval)
        } else {
            None
        }
    }

    pub fn poll_timeout(&mut self) -> Option<Instant> {
        [
            self.connection.poll_timeout(),
            self.keep_alive_deadline(),
            self.handshake_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.connection.handle_timeout(now);

        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline && !self.encryption_established {
                tracing::warn!("[WARN] {} handshake timed out", self.id);
                self.connection.close(
                    now,
                    VarInt::from_u32(error_code::HANDSHAKE_TIMEOUT),
                    Bytes::from_static(b"handshake timeout"),
                );
                self.on_closed(CloseReason::Timeout);
                return;
            }
        }

        match self.keep_alive_deadline() {
            Some(deadline) if now >= deadline => {
                self.connection.ping();
                self.last_keep_alive = now;
            }
            Some(_) => {}
            None => self.last_keep_alive = now,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats::from_quinn(
            &self.connection.stats(),
            self.connection.remote_address(),
            self.streams.len(),
        )
    }
}

impl Drop for QuicTransportSession {
    fn drop(&mut self) {
        tracing::trace!("[STOP] {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Recorded, Recorder, SessionPair};
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "used before initialize")]
    fn test_stream_creation_before_initialize_panics() {
        let mut session = SessionPair::unconnected_client_session();
        session.create_outgoing_bidirectional_stream();
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_initialize_panics() {
        let mut session = SessionPair::unconnected_client_session();
        session.initialize();
        session.initialize();
    }

    #[test]
    fn test_outgoing_refused_before_encryption() {
        let mut pair = SessionPair::new();
        let client = pair.client_session();
        assert_eq!(client.state(), SessionState::HandshakeInProgress);
        assert_eq!(
            client.outgoing_stream_gate(Dir::Bi),
            Err(StreamRefusal::EncryptionNotEstablished)
        );
        assert!(client.create_outgoing_bidirectional_stream().is_none());

        pair.handshake();
        let client = pair.client_session();
        assert_eq!(client.state(), SessionState::Active);
        assert!(client.should_create_outgoing_bidirectional_stream());
        assert!(client.create_outgoing_bidirectional_stream().is_some());
    }

    #[test]
    fn test_outgoing_ids_increase_with_client_parity() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let client = pair.client_session();
        let ids: Vec<u64> = (0..4)
            .map(|_| {
                let stream = client.create_outgoing_bidirectional_stream().unwrap();
                VarInt::from(stream.stream_id()).into_inner()
            })
            .collect();
        assert_eq!(ids, vec![0, 4, 8, 12]);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stream_limit_is_soft_refusal() {
        let mut pair = SessionPair::with_stream_limit(2);
        pair.handshake();
        let client = pair.client_session();
        assert!(client.create_outgoing_bidirectional_stream().is_some());
        assert!(client.create_outgoing_bidirectional_stream().is_some());
        assert!(client.create_outgoing_bidirectional_stream().is_none());
        assert_eq!(
            client.outgoing_stream_gate(Dir::Bi),
            Err(StreamRefusal::StreamLimitReached)
        );
        assert!(client.is_connected());
    }

    #[test]
    #[should_panic(expected = "must not create outgoing unidirectional")]
    fn test_client_unidirectional_is_programming_error() {
        let mut pair = SessionPair::new();
        pair.handshake();
        pair.client_session().create_outgoing_unidirectional_stream();
    }

    #[test]
    fn test_server_may_open_unidirectional() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let stream = pair.server_session().create_outgoing_unidirectional_stream().unwrap();
        assert_eq!(stream.directionality(), Directionality::WriteUnidirectional);
        assert_eq!(VarInt::from(stream.stream_id()).into_inner(), 3);
    }

    #[test]
    fn test_forged_server_stream_id_closes_connection() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let server = pair.server_session();
        let forged = StreamId::new(Side::Server, Dir::Bi, 0);
        assert!(server.create_incoming_stream(forged).is_none());
        assert_eq!(server.state(), SessionState::Closed);
        assert!(!server.has_stream(forged));
        assert!(!server.is_connected());
        match server.take_signals().last() {
            Some(SessionSignal::Closed { reason, .. }) => assert_eq!(
                *reason,
                CloseReason::Application {
                    code: u64::from(error_code::INVALID_STREAM_ID),
                    reason: "client created a server-initiated stream id".to_string()
                }
            ),
            other => panic!("expected a close signal, got {:?}", other),
        }
    }

    #[test]
    fn test_goaway_soft_refusal_keeps_connection() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let server = pair.server_session();
        server.set_respect_goaway(true);
        server.on_goaway_received();
        assert_eq!(server.state(), SessionState::Draining);

        let candidate = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(
            server.should_create_incoming_stream(candidate),
            Err(StreamRefusal::GoawayReceived)
        );
        assert!(server.create_incoming_stream(candidate).is_none());
        assert!(server.is_connected());
        // Outgoing creation is gone after goaway, other operations still work.
        assert_eq!(server.outgoing_stream_gate(Dir::Bi), Err(StreamRefusal::GoawayReceived));
        assert!(server.stats().remote_address.is_some());
    }

    #[test]
    fn test_parity_checked_before_goaway() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let server = pair.server_session();
        server.set_respect_goaway(true);
        server.on_goaway_received();
        let forged = StreamId::new(Side::Server, Dir::Uni, 0);
        assert_eq!(
            server.should_create_incoming_stream(forged),
            Err(StreamRefusal::InvalidStreamId)
        );
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[test]
    fn test_goaway_datagram_reaches_peer() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let recorder = Recorder::new();
        pair.server_session().set_visitor(recorder.clone());
        assert!(pair.client_session().go_away());
        pair.pump();
        assert!(pair.server_session().goaway_received());
        pair.flush_events();
        assert!(recorder.events().contains(&Recorded::Goaway));
    }

    #[test]
    fn test_write_over_buffer_limit_is_refused_whole() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let client = pair.client_session();
        let id = client.create_outgoing_bidirectional_stream().unwrap().stream_id();
        let limit = SessionOptions::default().max_buffered_bytes_per_stream;

        let oversized = vec![7u8; limit * 8];
        assert_eq!(client.stream_write(id, &oversized, false), 0);
        assert_eq!(client.stream_buffered_bytes(id), 0);
        assert!(client.stream_can_write(id));

        let exact = vec![7u8; limit];
        assert_eq!(client.stream_write(id, &exact, false), limit);
        assert!(client.stream_buffered_bytes(id) <= limit);
        // Whatever is still buffered plus a full payload no longer fits.
        if client.stream_buffered_bytes(id) > 0 {
            assert_eq!(client.stream_write(id, &exact, false), 0);
        }
    }

    #[test]
    fn test_keep_alive_tracks_open_streams() {
        let mut pair = SessionPair::new();
        pair.handshake();
        let client = pair.client_session();
        assert!(!client.should_keep_connection_alive());
        let stream = client.create_outgoing_bidirectional_stream().unwrap();
        assert!(client.should_keep_connection_alive());
        client.stream_close(stream.stream_id());
        // Fin sent but neither acknowledged nor the peer's side finished.
        assert!(client.should_keep_connection_alive());
    }

    #[test]
    fn test_handshake_timeout_reports_failure() {
        let mut session = SessionPair::unconnected_client_session();
        session.initialize();
        let now = Instant::now();
        session.start_handshake(now);
        assert!(session.poll_timeout().is_some());
        session.handle_timeout(now + Duration::from_secs(60));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.take_signals(),
            vec![SessionSignal::Closed {
                reason: CloseReason::Timeout,
                during_handshake: true
            }]
        );
    }
}
