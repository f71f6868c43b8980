//! Per-connection session: owns one TCP connection and its command loop.
//!
//! A session splits its stream into halves: the read half is consumed by
//! the command loop task, the write half lives behind a mutex so command
//! handlers and the copyover coordinator can send to the client at any
//! time. Closing is cooperative: `close` raises a flag and notifies the
//! loop, which exits, deregisters, and drops the socket.

use crate::server::Server;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// One live client connection.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    fd: RawFd,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: tokio::sync::Notify,
}

impl Session {
    /// Wrap an accepted (or adopted) stream.
    ///
    /// Returns the session handle and the read half for the command
    /// loop. The raw descriptor is captured up front so the copyover
    /// coordinator can export it later without touching the halves.
    pub fn new(stream: TcpStream, id: u64) -> io::Result<(Arc<Self>, OwnedReadHalf)> {
        let peer = stream.peer_addr()?;
        let fd = stream.as_raw_fd();
        let (reader, writer) = stream.into_split();

        let session = Arc::new(Session {
            id,
            peer,
            fd,
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_notify: tokio::sync::Notify::new(),
        });

        Ok((session, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Raw descriptor of the underlying socket. Valid for the lifetime
    /// of the session; only the copyover coordinator should use it, and
    /// only to duplicate it.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Best-effort send. A failure is logged and non-fatal: the next
    /// read on the connection will fail and end the loop naturally.
    pub async fn write(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(bytes).await {
            warn!(session = self.id, error = %e, "Failed to write to client");
        }
    }

    pub async fn write_str(&self, text: &str) {
        self.write(text.as_bytes()).await;
    }

    /// Request the session end. Idempotent; repeated calls are no-ops.
    ///
    /// The socket itself is closed by the command loop when it observes
    /// the flag and drops its halves, so a pending read is unblocked
    /// without the writer side racing a mid-flight send.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once `close` has been called. The notify future is
    /// registered before the flag check so a concurrent close cannot
    /// slip between them.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Command loop for one session.
///
/// Registers the session, then repeats: read one line, dispatch it,
/// wait for the next shared tick. Exits on close request, peer
/// disconnect, or transport error; deregistration and socket close
/// happen on every exit path.
pub async fn run(server: Arc<Server>, session: Arc<Session>, reader: OwnedReadHalf) {
    server.registry().add(Arc::clone(&session));

    // The stop sequence raises the shutdown flag before sweeping the
    // registry. A session registering after that sweep missed it, so
    // it must close itself or the drain would wait on it forever.
    if server.is_shutdown() {
        session.close();
    }

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut tick = server.subscribe_tick();

    loop {
        line.clear();
        tokio::select! {
            _ = session.closed() => break,
            result = reader.read_line(&mut line) => match result {
                Ok(0) => {
                    debug!(session = session.id(), "Connection closed by peer");
                    break;
                }
                Ok(_) => {
                    trace!(session = session.id(), input = %line.trim_end(), "Input received");
                    dispatch(&server, &session, &line).await;
                    if session.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session = session.id(), error = %e, "Read failed");
                    break;
                }
            }
        }

        // One command per session per tick
        tokio::select! {
            _ = session.closed() => break,
            _ = tick.changed() => {}
        }
    }

    server.registry().remove(&session);
    session.close();
    info!(peer = %session.peer(), "Disconnected");
}

/// Split a line into whitespace-delimited tokens and invoke the named
/// command. An empty or whitespace-only line yields an empty name,
/// which fails the table lookup like any other unknown name and gets
/// the literal `unknown command` response.
pub async fn dispatch(server: &Arc<Server>, session: &Arc<Session>, line: &str) {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().unwrap_or("");
    let args: Vec<&str> = tokens.collect();

    match server.commands().get(name) {
        Some(command) => command.act(server, session, &args).await,
        None => session.write_str("unknown command").await,
    }
}
