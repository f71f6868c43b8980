//! Live process replacement via descriptor inheritance.
//!
//! A copyover re-executes the server binary while keeping every
//! established connection open. The parent duplicates the listener and
//! each client socket into inheritable descriptors, spawns the child
//! with `--copyover-fds <count>` and the descriptors remapped to fixed
//! slots, then tears itself down. The child rebuilds the listener from
//! slot 0 and one session per following slot.
//!
//! Descriptor ownership transfers to the child: the parent's duplicates
//! are closed right after spawn and never used for I/O.

use crate::server::Server;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// First descriptor slot in the child: slot 0 (the listener) lands on
/// fd 3, directly after the inherited standard streams.
pub const FD_BASE: RawFd = 3;

/// How long the child waits before adopting, so the parent's teardown
/// is committed before the sockets are read again.
const ADOPTION_GRACE: Duration = Duration::from_secs(2);

/// Parent side: export descriptors, spawn the successor, then trigger
/// our own shutdown.
///
/// A client whose descriptor cannot be exported is dropped (logged) and
/// the handoff continues. A child that fails to start is logged and the
/// teardown proceeds anyway; connections are lost in that case.
pub async fn initiate(server: &Arc<Server>) {
    let listener_fd = match server.listener_fd() {
        Some(fd) => fd,
        None => {
            warn!("Copyover aborted, server is not listening");
            return;
        }
    };

    let listener = match export_fd(listener_fd) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "Copyover aborted, unable to export listener");
            return;
        }
    };

    // Slot order is fixed by the registry snapshot
    let mut fds: Vec<OwnedFd> = vec![listener];
    for session in server.registry().snapshot() {
        match export_fd(session.raw_fd()) {
            Ok(fd) => {
                session.write_str("*** copyover started, hold on ***").await;
                fds.push(fd);
            }
            Err(e) => {
                warn!(session = session.id(), error = %e, "Client dropped from copyover");
            }
        }
    }

    match spawn_successor(&fds) {
        Ok(child) => {
            info!(pid = child.id(), fds = fds.len(), "Copyover child started");
        }
        Err(e) => {
            error!(error = %e, "Copyover failed");
        }
    }

    // The child owns the descriptors now; close our duplicates and die.
    drop(fds);
    server.shutdown();
}

/// Child side: rebuild the listener from slot 0 and one session per
/// following slot. A slot that cannot be rebuilt or greeted loses that
/// client; a listener that cannot be rebuilt is fatal.
pub async fn adopt(server: &Arc<Server>, count: usize) -> io::Result<TcpListener> {
    info!(fds = count, "Recovering from copyover");
    tokio::time::sleep(ADOPTION_GRACE).await;

    let listener = adopt_listener(FD_BASE)?;

    for slot in 1..count {
        let fd = FD_BASE + slot as RawFd;
        let stream = match adopt_stream(fd) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(slot, error = %e, "Client lost in copyover");
                continue;
            }
        };
        if let Err(e) = server.adopt_session(stream).await {
            warn!(slot, error = %e, "Client lost in copyover");
        }
    }

    Ok(listener)
}

/// Duplicate a descriptor into an inheritable copy.
///
/// `dup` leaves close-on-exec clear on the new descriptor, which is
/// exactly what inheritance needs.
fn export_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Re-execute the current binary with the exported descriptors remapped
/// to slots `FD_BASE..FD_BASE + n`. Standard streams are inherited.
fn spawn_successor(fds: &[OwnedFd]) -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let mut staged: Vec<RawFd> = Vec::with_capacity(raw.len());

    let mut cmd = Command::new(exe);
    cmd.arg("--copyover-fds").arg(fds.len().to_string());

    // Runs in the forked child before exec. Two passes: first stage
    // every source above the target range, then place each staged copy
    // on its slot. Staging first means a source sitting inside the
    // target range cannot be clobbered before it is copied.
    unsafe {
        cmd.pre_exec(move || {
            let floor = FD_BASE + raw.len() as RawFd;
            staged.clear();
            for &fd in &raw {
                let dup = libc::fcntl(fd, libc::F_DUPFD, floor);
                if dup < 0 {
                    return Err(io::Error::last_os_error());
                }
                staged.push(dup);
            }
            for (slot, &fd) in staged.iter().enumerate() {
                let target = FD_BASE + slot as RawFd;
                if libc::dup2(fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Take ownership of an inherited listener descriptor.
fn adopt_listener(fd: RawFd) -> io::Result<TcpListener> {
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Take ownership of an inherited client descriptor.
fn adopt_stream(fd: RawFd) -> io::Result<TcpStream> {
    let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}
