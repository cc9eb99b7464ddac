use std::io;
use std::rc::Rc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::dispatcher::Dispatcher;
use super::runner::{take_local_state, with_local_state};

const MAX_UDP_PAYLOAD: usize = 65535;

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Errors that a later receive on an unconnected socket will not repeat.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Close every session and uninstall the dispatcher so the owner can bind again.
fn abandon_dispatcher() {
    with_local_state::<Dispatcher, _>(Dispatcher::shutdown);
    drop(take_local_state::<Dispatcher>());
}

/// 读循环：在 I/O 线程上运行，直到分发器被移除或关闭
///
/// Each wakeup reads at most `max_reads_per_iteration` datagrams before
/// yielding, so posted handle operations are not starved by incoming traffic.
/// A persistent socket error shuts the dispatcher down.
pub(crate) async fn run(socket: Rc<UdpSocket>, wake: Rc<Notify>) {
    let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];
    let local_addr = socket.local_addr().ok();
    tracing::debug!("[START] read loop on {:?}", local_addr);

    loop {
        let state = with_local_state::<Dispatcher, _>(|dispatcher| {
            (!dispatcher.is_shut_down()).then(|| (dispatcher.poll_timeout(), dispatcher.max_reads_per_iteration()))
        })
        .flatten();
        let Some((deadline, max_reads)) = state else {
            break;
        };

        tokio::select! {
            readable = socket.readable() => {
                if let Err(e) = readable {
                    tracing::error!("[ERROR] socket failed: {}", e);
                    abandon_dispatcher();
                    break;
                }

                let mut datagrams = Vec::new();
                let mut fatal = None;
                for _ in 0..max_reads {
                    match socket.try_recv_from(&mut buffer) {
                        Ok((len, from)) => datagrams.push((from, BytesMut::from(&buffer[..len]))),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if is_transient(&e) => {
                            tracing::debug!("[RECV] transient receive error: {}", e);
                        }
                        Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }

                if !datagrams.is_empty() {
                    let now = Instant::now();
                    with_local_state::<Dispatcher, _>(|dispatcher| {
                        for (from, data) in datagrams {
                            dispatcher.handle_datagram(now, from, data);
                        }
                    });
                }
                if let Some(e) = fatal {
                    tracing::error!("[ERROR] receive failed, shutting down: {}", e);
                    abandon_dispatcher();
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                with_local_state::<Dispatcher, _>(|dispatcher| dispatcher.handle_timeout(Instant::now()));
            }
            _ = wake.notified() => {}
        }

        // Let queued handle operations run between batches.
        tokio::task::yield_now().await;
    }

    tracing::debug!("[STOP] read loop on {:?}", local_addr);
}
