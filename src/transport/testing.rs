//! In-memory harness: two dispatchers wired back to back, packets pumped by hand.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use quinn_proto::Side;
use tokio::sync::Notify;

use super::dispatcher::{client_endpoint, server_endpoint, Dispatcher};
use super::packet_writer::PacketWriter;
use super::runner::TaskRunner;
use crate::adapters::{ProofSource, ProofVerifier};
use crate::error::CloseReason;
use crate::event::{ClientVisitor, Listener, ServerVisitor, SessionVisitor, StreamVisitor};
use crate::protocol::{QuicClientConfig, QuicServerConfig};
use crate::session::{
    ConnectionId, QuicTransportSession, SessionEnv, SessionHandle, SessionOptions, StreamHandle,
};
use crate::SessionId;

type Outbox = Rc<RefCell<VecDeque<Vec<u8>>>>;

struct QueueWriter(Outbox);

impl PacketWriter for QueueWriter {
    fn write_packet(&self, _destination: SocketAddr, packet: &[u8]) -> io::Result<()> {
        self.0.borrow_mut().push_back(packet.to_vec());
        Ok(())
    }
}

fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn test_env() -> SessionEnv {
    SessionEnv::new(
        TaskRunner::spawn("test-io").unwrap(),
        TaskRunner::spawn("test-events").unwrap(),
    )
}

pub(crate) struct SessionPair {
    pub server: Dispatcher,
    pub client: Dispatcher,
    server_outbox: Outbox,
    client_outbox: Outbox,
    client_id: SessionId,
    events: Arc<TaskRunner>,
}

impl SessionPair {
    pub fn new() -> Self {
        Self::build(QuicServerConfig::default(), None)
    }

    pub fn with_stream_limit(bidi: u32) -> Self {
        Self::build(QuicServerConfig::default().with_max_concurrent_streams(bidi, 100), None)
    }

    pub fn with_server_visitor(visitor: Arc<dyn ServerVisitor>) -> Self {
        Self::build(QuicServerConfig::default(), Some(visitor))
    }

    fn build(server_config: QuicServerConfig, visitor: Option<Arc<dyn ServerVisitor>>) -> Self {
        let env = test_env();
        let events = env.events.clone();

        let proof = ProofSource::self_signed(&["localhost"]).unwrap();
        let endpoint = server_endpoint(proof.server_config(&server_config).unwrap());
        let server_outbox = Outbox::default();
        let mut server = Dispatcher::new(
            Side::Server,
            endpoint,
            server_addr(),
            Box::new(QueueWriter(server_outbox.clone())),
            SessionEnv::new(env.io.clone(), env.events.clone()),
            SessionOptions {
                respect_goaway: server_config.respect_goaway,
                max_buffered_bytes_per_stream: server_config.max_buffered_bytes_per_stream,
                ..SessionOptions::default()
            },
            Rc::new(Notify::new()),
        );
        server.set_server_visitor(visitor);

        let client_config = QuicClientConfig::default();
        let client_outbox = Outbox::default();
        let mut client = Dispatcher::new(
            Side::Client,
            client_endpoint(),
            client_addr(),
            Box::new(QueueWriter(client_outbox.clone())),
            env,
            SessionOptions::default(),
            Rc::new(Notify::new()),
        );
        client.set_client_config(ProofVerifier::Insecure.client_config(&client_config).unwrap());
        let client_id = client.connect(Instant::now(), server_addr(), "localhost").unwrap();

        Self {
            server,
            client,
            server_outbox,
            client_outbox,
            client_id,
            events,
        }
    }

    /// A client session straight out of `connect`, not yet initialized or registered anywhere.
    pub fn unconnected_client_session() -> QuicTransportSession {
        let mut endpoint = client_endpoint();
        let config = ProofVerifier::Insecure
            .client_config(&QuicClientConfig::default())
            .unwrap();
        let (handle, connection) = endpoint
            .connect(Instant::now(), config, server_addr(), "localhost")
            .unwrap();
        let options = SessionOptions {
            handshake_timeout: Some(Duration::from_secs(5)),
            ..SessionOptions::default()
        };
        QuicTransportSession::new(SessionId::new(1), handle, connection, options, test_env())
    }

    pub fn connect_another_client(&mut self) -> SessionId {
        self.client
            .connect(Instant::now(), server_addr(), "localhost")
            .unwrap()
    }

    fn exchange(&mut self, now: Instant) -> bool {
        let to_server: Vec<Vec<u8>> = self.client_outbox.borrow_mut().drain(..).collect();
        let to_client: Vec<Vec<u8>> = self.server_outbox.borrow_mut().drain(..).collect();
        let moved = !to_server.is_empty() || !to_client.is_empty();
        for packet in to_server {
            self.server.handle_datagram(now, client_addr(), BytesMut::from(&packet[..]));
        }
        for packet in to_client {
            self.client.handle_datagram(now, server_addr(), BytesMut::from(&packet[..]));
        }
        moved
    }

    /// Move packets until both sides go quiet, running timers that are due shortly.
    pub fn pump(&mut self) {
        for _ in 0..500 {
            let now = Instant::now();
            self.server.drive_all(now);
            self.client.drive_all(now);
            if self.exchange(now) {
                continue;
            }
            let deadline = [self.server.poll_timeout(), self.client.poll_timeout()]
                .into_iter()
                .flatten()
                .min();
            match deadline {
                Some(deadline) if deadline <= now + Duration::from_millis(100) => {
                    std::thread::sleep(deadline.saturating_duration_since(now));
                    let now = Instant::now();
                    self.server.handle_timeout(now);
                    self.client.handle_timeout(now);
                }
                _ => return,
            }
        }
    }

    pub fn handshake(&mut self) {
        self.pump();
        assert!(self.client_session().is_session_ready(), "client handshake did not finish");
        assert!(self.server_session().is_session_ready(), "server handshake did not finish");
    }

    /// Fast-forward closed connections through their draining period.
    pub fn expire_draining(&mut self) {
        let later = Instant::now() + Duration::from_secs(10);
        for dispatcher in [&mut self.server, &mut self.client] {
            for id in dispatcher.session_ids() {
                let closing = match dispatcher.session_mut(id) {
                    Some(session) if session.connection().is_closed() => {
                        session.handle_timeout(later);
                        true
                    }
                    _ => false,
                };
                if closing {
                    dispatcher.drive(id, later);
                }
            }
        }
    }

    /// Wait until everything posted to the event runner so far has run.
    pub fn flush_events(&self) {
        self.events.invoke(|| ()).unwrap();
    }

    pub fn client_session_id(&self) -> SessionId {
        self.client_id
    }

    pub fn server_session_id(&self) -> SessionId {
        self.server.session_ids()[0]
    }

    pub fn client_session(&mut self) -> &mut QuicTransportSession {
        let id = self.client_id;
        self.client.session_mut(id).expect("client session")
    }

    pub fn server_session(&mut self) -> &mut QuicTransportSession {
        let id = self.server_session_id();
        self.server.session_mut(id).expect("server session")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    Session(SessionId),
    SessionClosed(SessionId),
    Ended,
    Connected(SessionId),
    ConnectionFailed(CloseReason),
    IncomingStream(u32),
    CanCreate(bool),
    Goaway,
    StreamClosed(u32),
    ConnectionClosed(CloseReason),
    Data(u32, Vec<u8>),
    FinRead(u32),
    CanWrite(u32),
    Closed(u32),
    Ready(SessionId, u32),
    ListenerFin(SessionId, u32),
    ListenerStreamClosed(SessionId, u32),
    ListenerSessionClosed(SessionId),
}

/// Records every callback of every visitor trait, in delivery order.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// All bytes delivered for `stream_id`, concatenated.
    pub fn data(&self, stream_id: u32) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Data(id, data) if *id == stream_id => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn on_data_calls(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Recorded::Data(..)))
            .count()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().push(event);
    }
}

impl ServerVisitor for Recorder {
    fn on_session(&self, session: SessionHandle) {
        self.push(Recorded::Session(session.id()));
    }

    fn on_session_closed(&self, session_id: SessionId, _connection_id: ConnectionId) {
        self.push(Recorded::SessionClosed(session_id));
    }

    fn on_ended(&self) {
        self.push(Recorded::Ended);
    }
}

impl ClientVisitor for Recorder {
    fn on_connected(&self, session: SessionHandle) {
        self.push(Recorded::Connected(session.id()));
    }

    fn on_connection_failed(&self, reason: &CloseReason) {
        self.push(Recorded::ConnectionFailed(reason.clone()));
    }
}

impl SessionVisitor for Recorder {
    fn on_incoming_stream(&self, _session: &SessionHandle, stream: StreamHandle) {
        self.push(Recorded::IncomingStream(stream.id()));
    }

    fn on_can_create_new_stream(&self, _session: &SessionHandle, unidirectional: bool) {
        self.push(Recorded::CanCreate(unidirectional));
    }

    fn on_goaway(&self, _session: &SessionHandle) {
        self.push(Recorded::Goaway);
    }

    fn on_stream_closed(&self, _session: &SessionHandle, stream_id: u32) {
        self.push(Recorded::StreamClosed(stream_id));
    }

    fn on_connection_closed(&self, _session: &SessionHandle, reason: &CloseReason) {
        self.push(Recorded::ConnectionClosed(reason.clone()));
    }
}

impl StreamVisitor for Recorder {
    fn on_data(&self, stream: &StreamHandle, data: &[u8]) {
        self.push(Recorded::Data(stream.id(), data.to_vec()));
    }

    fn on_fin_read(&self, stream: &StreamHandle) {
        self.push(Recorded::FinRead(stream.id()));
    }

    fn on_can_write(&self, stream: &StreamHandle) {
        self.push(Recorded::CanWrite(stream.id()));
    }

    fn on_closed(&self, stream: &StreamHandle) {
        self.push(Recorded::Closed(stream.id()));
    }
}

impl Listener for Recorder {
    fn on_ready(&self, session_id: SessionId, stream_id: u32) {
        self.push(Recorded::Ready(session_id, stream_id));
    }

    fn on_data(&self, _session_id: SessionId, stream_id: u32, data: &[u8]) {
        self.push(Recorded::Data(stream_id, data.to_vec()));
    }

    fn on_fin_read(&self, session_id: SessionId, stream_id: u32) {
        self.push(Recorded::ListenerFin(session_id, stream_id));
    }

    fn on_stream_closed(&self, session_id: SessionId, stream_id: u32) {
        self.push(Recorded::ListenerStreamClosed(session_id, stream_id));
    }

    fn on_session_closed(&self, session_id: SessionId) {
        self.push(Recorded::ListenerSessionClosed(session_id));
    }
}
