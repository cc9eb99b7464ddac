use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use quinn_proto::{Connection, Dir, FinishError, ReadError, Side, StreamId, VarInt, WriteError};

use crate::event::StreamVisitor;

/// 流的方向性，构造后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Bidirectional,
    /// Opened by the peer; we only read.
    ReadUnidirectional,
    /// Opened locally; we only write.
    WriteUnidirectional,
}

impl Directionality {
    pub(crate) fn of(id: StreamId, local_side: Side) -> Self {
        match (id.dir(), id.initiator() == local_side) {
            (Dir::Bi, _) => Directionality::Bidirectional,
            (Dir::Uni, true) => Directionality::WriteUnidirectional,
            (Dir::Uni, false) => Directionality::ReadUnidirectional,
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, Directionality::WriteUnidirectional)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, Directionality::ReadUnidirectional)
    }
}

/// Bytes pulled off the receive side in one pass.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    /// Contiguous regions in stream order.
    pub regions: Vec<Bytes>,
    /// The fin was reached during this pass.
    pub fin: bool,
    /// The peer reset its side during this pass.
    pub reset: Option<VarInt>,
}

impl ReadOutcome {
    pub fn len(&self) -> usize {
        self.regions.iter().map(Bytes::len).sum()
    }
}

/// I/O 线程上的流适配器
///
/// Owns the write buffer and the read/write side bookkeeping of one quinn-proto
/// stream. It never holds the connection; every operation borrows it from the
/// owning session.
pub(crate) struct StreamAdapter {
    id: StreamId,
    directionality: Directionality,
    visitor: Option<Arc<dyn StreamVisitor>>,
    pending: VecDeque<Bytes>,
    buffered_bytes: usize,
    max_buffered_bytes: usize,
    /// Fin requested locally, sent once `pending` drains.
    fin_buffered: bool,
    /// Fin sent, or the peer stopped our side.
    write_closed: bool,
    /// Nothing left for the peer to acknowledge.
    write_done: bool,
    read_closed: bool,
    fin_delivered: bool,
}

impl StreamAdapter {
    pub fn new(id: StreamId, directionality: Directionality, max_buffered_bytes: usize) -> Self {
        let writable = directionality.is_writable();
        let readable = directionality.is_readable();
        Self {
            id,
            directionality,
            visitor: None,
            pending: VecDeque::new(),
            buffered_bytes: 0,
            max_buffered_bytes,
            fin_buffered: false,
            write_closed: !writable,
            write_done: !writable,
            read_closed: !readable,
            fin_delivered: !readable,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn directionality(&self) -> Directionality {
        self.directionality
    }

    pub fn visitor(&self) -> Option<Arc<dyn StreamVisitor>> {
        self.visitor.clone()
    }

    pub fn set_visitor(&mut self, visitor: Arc<dyn StreamVisitor>) {
        self.visitor = Some(visitor);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn can_write(&self) -> bool {
        !self.write_closed && !self.fin_buffered && self.buffered_bytes < self.max_buffered_bytes
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// Accept the whole payload or nothing.
    ///
    /// Writes after the write side closed are dropped quietly: a local close can
    /// race with writes the application already had in flight. A payload that
    /// would take the buffer past its limit is refused whole.
    pub fn write(&mut self, conn: &mut Connection, data: &[u8], fin: bool) -> usize {
        if !self.can_write() {
            tracing::trace!("[SEND] stream {} not writable, dropping {} bytes", self.id, data.len());
            return 0;
        }
        if self.buffered_bytes + data.len() > self.max_buffered_bytes {
            tracing::debug!(
                "[SEND] stream {} refused {} bytes ({} of {} buffered)",
                self.id,
                data.len(),
                self.buffered_bytes,
                self.max_buffered_bytes
            );
            return 0;
        }
        if !data.is_empty() {
            self.pending.push_back(Bytes::copy_from_slice(data));
            self.buffered_bytes += data.len();
        }
        if fin {
            self.fin_buffered = true;
        }
        self.flush(conn);
        data.len()
    }

    /// Hand buffered bytes to the transport; sends the fin once the buffer is empty.
    /// Returns true when nothing is left buffered.
    pub fn flush(&mut self, conn: &mut Connection) -> bool {
        if self.write_closed {
            return self.pending.is_empty();
        }

        let mut stopped = None;
        {
            let mut send = conn.send_stream(self.id);
            while let Some(chunk) = self.pending.front_mut() {
                match send.write(&chunk[..]) {
                    Ok(written) => {
                        self.buffered_bytes -= written;
                        if written == chunk.len() {
                            self.pending.pop_front();
                        } else {
                            chunk.advance(written);
                        }
                    }
                    Err(WriteError::Blocked) => break,
                    Err(WriteError::Stopped(code)) => {
                        stopped = Some(code);
                        break;
                    }
                    Err(WriteError::ClosedStream) => {
                        stopped = Some(VarInt::from_u32(0));
                        break;
                    }
                }
            }
        }
        if let Some(code) = stopped {
            self.on_stopped(code);
            return true;
        }

        if self.pending.is_empty() && self.fin_buffered {
            self.write_closed = true;
            match conn.send_stream(self.id).finish() {
                Ok(()) => tracing::trace!("[CLOSE] stream {} fin sent", self.id),
                Err(FinishError::Stopped(code)) => self.on_stopped(code),
                Err(FinishError::ClosedStream) => self.write_done = true,
            }
        }
        self.pending.is_empty()
    }

    /// Request the write side be finalized. Only the first call has an effect.
    pub fn close(&mut self, conn: &mut Connection) {
        if self.write_closed || self.fin_buffered {
            return;
        }
        self.fin_buffered = true;
        self.flush(conn);
    }

    /// Peer sent STOP_SENDING (or the stream vanished): abandon buffered data.
    pub fn on_stopped(&mut self, code: VarInt) {
        tracing::debug!("[CLOSE] stream {} stopped by peer (code {})", self.id, code);
        self.pending.clear();
        self.buffered_bytes = 0;
        self.write_closed = true;
        self.write_done = true;
    }

    /// The peer acknowledged everything including the fin.
    pub fn on_finished(&mut self) {
        self.write_done = true;
    }

    /// Whether the fin still has to be reported to a visitor.
    pub fn take_fin_notification(&mut self) -> bool {
        if self.read_closed && !self.fin_delivered {
            self.fin_delivered = true;
            return true;
        }
        false
    }

    /// Drain every contiguous region the transport currently has.
    ///
    /// Reading until the transport reports `Blocked` is what re-arms the
    /// `Readable` event, so a pass never stops early while the side is open.
    pub fn drain(&mut self, conn: &mut Connection) -> ReadOutcome {
        self.read_up_to(conn, usize::MAX)
    }

    /// Pull at most `max_len` bytes.
    pub fn read_up_to(&mut self, conn: &mut Connection, max_len: usize) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        if self.read_closed || max_len == 0 {
            return outcome;
        }

        let mut recv = conn.recv_stream(self.id);
        let mut chunks = match recv.read(true) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::debug!("[RECV] stream {} not readable: {:?}", self.id, e);
                self.read_closed = true;
                return outcome;
            }
        };

        let mut remaining = max_len;
        while remaining > 0 {
            match chunks.next(remaining) {
                Ok(Some(chunk)) => {
                    remaining -= chunk.bytes.len();
                    outcome.regions.push(chunk.bytes);
                }
                Ok(None) => {
                    outcome.fin = true;
                    break;
                }
                Err(ReadError::Blocked) => break,
                Err(ReadError::Reset(code)) => {
                    outcome.reset = Some(code);
                    break;
                }
            }
        }
        // Finalizing hands flow-control credit back to the peer.
        let _ = chunks.finalize();

        if outcome.fin || outcome.reset.is_some() {
            self.read_closed = true;
        }
        if outcome.reset.is_some() {
            // A reset stream has no fin to report.
            self.fin_delivered = true;
        }
        outcome
    }

    /// Refuse a stream we do not want: stop reading and reset writing.
    pub fn reject(conn: &mut Connection, id: StreamId, local_side: Side, code: VarInt) {
        let directionality = Directionality::of(id, local_side);
        if directionality.is_readable() {
            let _ = conn.recv_stream(id).stop(code);
        }
        if directionality.is_writable() {
            let _ = conn.send_stream(id).reset(code);
        }
    }

    /// Both sides are finished and the stream can be dropped.
    pub fn is_reclaimable(&self) -> bool {
        self.write_done && self.read_closed && self.fin_delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directionality_from_id() {
        let client_bidi = StreamId::new(Side::Client, Dir::Bi, 0);
        let client_uni = StreamId::new(Side::Client, Dir::Uni, 0);
        assert_eq!(Directionality::of(client_bidi, Side::Server), Directionality::Bidirectional);
        assert_eq!(Directionality::of(client_uni, Side::Server), Directionality::ReadUnidirectional);
        assert_eq!(Directionality::of(client_uni, Side::Client), Directionality::WriteUnidirectional);
    }

    #[test]
    fn test_read_only_stream_is_never_writable() {
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let adapter = StreamAdapter::new(id, Directionality::ReadUnidirectional, 1024);
        assert!(!adapter.can_write());
        assert!(!adapter.is_read_closed());
    }

    #[test]
    fn test_write_only_stream_has_no_read_side() {
        let id = StreamId::new(Side::Server, Dir::Uni, 0);
        let mut adapter = StreamAdapter::new(id, Directionality::WriteUnidirectional, 1024);
        assert!(adapter.is_read_closed());
        // Nothing to report for a side that never existed.
        assert!(!adapter.take_fin_notification());
    }
}
