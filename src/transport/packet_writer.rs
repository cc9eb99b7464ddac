use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::UdpSocket;

/// 出站数据包写入器
///
/// The dispatcher only ever hands complete UDP payloads to a writer; it has no
/// notion of sockets, which keeps it drivable from tests without any I/O.
pub(crate) trait PacketWriter {
    fn write_packet(&self, destination: SocketAddr, packet: &[u8]) -> io::Result<()>;
}

/// Writes straight to the endpoint's non-blocking UDP socket.
pub(crate) struct UdpPacketWriter {
    socket: Rc<UdpSocket>,
}

impl UdpPacketWriter {
    pub fn new(socket: Rc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl PacketWriter for UdpPacketWriter {
    fn write_packet(&self, destination: SocketAddr, packet: &[u8]) -> io::Result<()> {
        match self.socket.try_send_to(packet, destination) {
            Ok(_) => Ok(()),
            // QUIC retransmits lost packets; a full socket buffer is just loss.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!("[SEND] socket buffer full, dropping packet to {}", destination);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
