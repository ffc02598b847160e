//! TCP splice plumbing
//!
//! The listener accepting connections to splice over the bond, and the
//! per-flow reader/writer tasks that feed the engine through the event
//! channel.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::Event;

/// Driver-side handle to one spliced flow's socket tasks
pub struct FlowHandle {
    pub write_tx: mpsc::Sender<Bytes>,
    pub pause_tx: watch::Sender<bool>,
    read_task: JoinHandle<()>,
}

impl FlowHandle {
    /// Stop both tasks; dropping the writer half closes the socket
    pub fn close(self) {
        self.read_task.abort();
        // write_tx drops here, ending the write task
    }
}

/// Accept connections forever, handing each to the driver
pub async fn accept_task(listener: TcpListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                // with a transparent listener this is the address the
                // client originally dialed, which the remote side must
                // reproduce
                let destination = match socket.local_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!("getsockname failed: {e}");
                        continue;
                    }
                };
                debug!(%peer, %destination, "connection accepted");
                socket.set_nodelay(true).ok();
                if events
                    .send(Event::TcpAccepted {
                        socket,
                        destination,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Dial the destination a peer's open asked for
pub fn spawn_dial(flow: u32, to: SocketAddr, events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        match TcpStream::connect(to).await {
            Ok(socket) => {
                socket.set_nodelay(true).ok();
                let _ = events.send(Event::TcpConnected { flow, socket }).await;
            }
            Err(e) => {
                warn!(flow, %to, "dial failed: {e}");
                let _ = events.send(Event::TcpConnectFailed { flow }).await;
            }
        }
    });
}

/// Wire a connected socket into reader/writer tasks for a flow
pub fn register(flow: u32, socket: TcpStream, mtu: usize, events: mpsc::Sender<Event>) -> FlowHandle {
    let (read_half, write_half) = socket.into_split();
    let (write_tx, write_rx) = mpsc::channel::<Bytes>(4);
    let (pause_tx, pause_rx) = watch::channel(false);

    let read_task = tokio::spawn(read_task(flow, read_half, mtu, events.clone(), pause_rx));
    tokio::spawn(write_task(flow, write_half, write_rx, events));

    FlowHandle {
        write_tx,
        pause_tx,
        read_task,
    }
}

async fn read_task(
    flow: u32,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mtu: usize,
    events: mpsc::Sender<Event>,
    mut pause: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; mtu];
    loop {
        while *pause.borrow() {
            if pause.changed().await.is_err() {
                return;
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(flow, "socket EOF");
                let _ = events.send(Event::TcpReadClosed { flow }).await;
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(Event::TcpRead { flow, data }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(flow, "socket read error: {e}");
                let _ = events.send(Event::TcpReadClosed { flow }).await;
                return;
            }
        }
    }
}

async fn write_task(
    flow: u32,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut chunks: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<Event>,
) {
    while let Some(chunk) = chunks.recv().await {
        match writer.write_all(&chunk).await {
            Ok(()) => {
                if events.send(Event::TcpWriteDone { flow }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(flow, "socket write error: {e}");
                let _ = events.send(Event::TcpWriteError { flow }).await;
                return;
            }
        }
    }
}
