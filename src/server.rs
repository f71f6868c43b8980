//! TCP server: accept loop, shared tick, and the shutdown state machine.
//!
//! One task runs the accept loop, one task drives the shared tick, and
//! each connection gets its own session task. Shutdown is cooperative:
//! an idempotent trigger flips a watch channel, the accept loop exits
//! (closing the listener), every session is asked to close, and the
//! stop sequence waits for the registry to drain.

use crate::commands::CommandTable;
use crate::config::Config;
use crate::copyover;
use crate::registry::Registry;
use crate::session::{self, Session};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Server instance; exactly one per process.
pub struct Server {
    config: Config,
    registry: Registry<Arc<Session>>,
    commands: CommandTable,
    tick_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    stopping: AtomicBool,
    listener_fd: AtomicI32,
    local_addr: OnceLock<SocketAddr>,
    next_session_id: AtomicU64,
}

impl Server {
    pub fn new(config: Config, commands: CommandTable) -> Arc<Self> {
        let (tick_tx, _) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        Arc::new(Server {
            config,
            registry: Registry::new(),
            commands,
            tick_tx,
            shutdown_tx,
            stopped_tx,
            stopping: AtomicBool::new(false),
            listener_fd: AtomicI32::new(-1),
            local_addr: OnceLock::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Registry<Arc<Session>> {
        &self.registry
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Receiver on the shared tick; sessions await a change between
    /// commands, throttling each to one command per tick.
    pub fn subscribe_tick(&self) -> watch::Receiver<u64> {
        self.tick_tx.subscribe()
    }

    /// Raw descriptor of the listening socket, once listening.
    pub fn listener_fd(&self) -> Option<RawFd> {
        match self.listener_fd.load(Ordering::SeqCst) {
            fd if fd < 0 => None,
            fd => Some(fd),
        }
    }

    /// Bound address, once listening. Also used by tests to find a
    /// port-0 server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Run the full lifecycle: bind or adopt, accept until a shutdown
    /// trigger or termination signal arrives, then stop.
    ///
    /// Listener bind failure is the one startup error that aborts the
    /// process; everything below the session boundary is contained.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = if self.config.copyover_fds == 0 {
            let addr = format!("{}:{}", self.config.host, self.config.port);
            let listener = TcpListener::bind(&addr).await?;
            info!(address = %listener.local_addr()?, "Server listening");
            listener
        } else {
            let listener = copyover::adopt(&self, self.config.copyover_fds).await?;
            info!(address = %listener.local_addr()?, sessions = self.registry.len(),
                "Server listening after copyover");
            listener
        };

        self.listener_fd
            .store(listener.as_raw_fd(), Ordering::SeqCst);
        let _ = self.local_addr.set(listener.local_addr()?);

        self.spawn_tick_task();

        let accept_server = Arc::clone(&self);
        tokio::spawn(async move { accept_server.accept_loop(listener).await });

        self.wait_for_shutdown().await?;
        self.stop().await;
        Ok(())
    }

    /// Non-blocking, idempotent shutdown trigger. Safe from any task,
    /// including a session's own command handler.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Full stop sequence. Exactly one caller performs it: trigger
    /// shutdown (the accept loop exits and the listener closes once),
    /// ask every session to close, wait for the registry to drain.
    /// Concurrent or repeated callers block until that drain completes.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let mut stopped = self.stopped_tx.subscribe();
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    return;
                }
            }
            return;
        }

        info!("Shutting down");
        self.shutdown();

        self.registry.for_each(|session| session.close());

        debug!(sessions = self.registry.len(), "Waiting for sessions to drain");
        self.registry.wait().await;

        self.stopped_tx.send_replace(true);
        info!("Server stopped");
    }

    /// Adopt one inherited connection after a copyover: greet the
    /// client, then run a fresh session for it.
    pub(crate) async fn adopt_session(self: &Arc<Self>, mut stream: TcpStream) -> io::Result<()> {
        stream.write_all(b"\n\nWelcome Back From Copyover\n").await?;
        debug!(peer = %stream.peer_addr()?, "Session adopted");
        self.spawn_session(stream);
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream) {
        // An accept can resolve in the same instant stop() runs; a
        // session spawned now would only prolong the drain.
        if self.is_shutdown() {
            debug!("Refusing connection during shutdown");
            return;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (session, reader) = match Session::new(stream, id) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Failed to set up session");
                return;
            }
        };

        let server = Arc::clone(self);
        tokio::spawn(async move { session::run(server, session, reader).await });
    }

    /// Accept until shutdown or a listener failure. The listener is
    /// owned here, so leaving the loop closes it exactly once.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "Accepted connection");
                        self.spawn_session(stream);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        break;
                    }
                }
            }
        }
        debug!("Accept loop finished");
    }

    fn spawn_tick_task(&self) {
        let tick_tx = self.tick_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.tick_millis);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick_tx.send_modify(|tick| *tick += 1);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Block until a termination signal or an internal shutdown trigger
    /// (the copyover handler, or a direct `stop` call).
    async fn wait_for_shutdown(&self) -> io::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            _ = sigterm.recv() => info!("Terminate received"),
            _ = sigquit.recv() => info!("Quit received"),
            _ = shutdown.changed() => info!("Shutdown requested"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::time::timeout;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            tick_millis: 10,
            log_level: "info".to_string(),
            copyover_fds: 0,
        }
    }

    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let server = Server::new(test_config(), CommandTable::builtin());
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        for _ in 0..200 {
            if let Some(addr) = server.local_addr() {
                return (server, addr);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server did not start listening");
    }

    async fn wait_for_sessions(server: &Arc<Server>, count: usize) {
        for _ in 0..200 {
            if server.registry().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} registered sessions");
    }

    async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(2), stream.read_line(&mut line))
            .await
            .expect("read timed out")
            .unwrap();
        line
    }

    #[tokio::test]
    async fn test_echo_over_the_wire() {
        let (server, addr) = start_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = BufReader::new(stream);

        stream
            .get_mut()
            .write_all(b"echo hello world\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "hello world\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_command_over_the_wire() {
        let (server, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"bogus\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"unknown command");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_quit_closes_and_deregisters() {
        let (server, addr) = start_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = BufReader::new(stream);

        wait_for_sessions(&server, 1).await;

        stream.get_mut().write_all(b"quit\n").await.unwrap();
        assert_eq!(read_line(&mut stream).await, "You have left\n");

        // Connection closes and the session is removed
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), stream.get_mut().read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(n, 0);

        timeout(Duration::from_secs(2), server.registry().wait())
            .await
            .expect("registry should drain after quit");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_pipelined_commands_both_answered() {
        let (server, addr) = start_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = BufReader::new(stream);

        // Both lines arrive at once; the tick throttle must not drop
        // or reorder the second command.
        stream
            .get_mut()
            .write_all(b"echo one\necho two\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "one\n");
        assert_eq!(read_line(&mut stream).await, "two\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients_and_drains() {
        let (server, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        wait_for_sessions(&server, 1).await;

        timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop should complete");
        assert!(server.registry().is_empty());

        // Client observes the close
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_concurrent_stop_is_idempotent() {
        let (server, addr) = start_server().await;
        let _stream = TcpStream::connect(addr).await.unwrap();

        wait_for_sessions(&server, 1).await;

        let first = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.stop().await })
        };
        let second = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.stop().await })
        };

        timeout(Duration::from_secs(2), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("both stop calls should return after the drain");
        assert!(server.registry().is_empty());

        // Repeated stop after the fact returns immediately
        timeout(Duration::from_secs(1), server.stop())
            .await
            .expect("repeated stop should not block");
    }

    #[tokio::test]
    async fn test_adopted_session_is_greeted_and_answers_commands() {
        let (server, _addr) = start_server().await;

        // A connection pair standing in for an inherited descriptor
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let mut client = BufReader::new(client);
        let (accepted, _) = listener.accept().await.unwrap();

        server.adopt_session(accepted).await.unwrap();

        assert_eq!(read_line(&mut client).await, "\n");
        assert_eq!(read_line(&mut client).await, "\n");
        assert_eq!(read_line(&mut client).await, "Welcome Back From Copyover\n");

        wait_for_sessions(&server, 1).await;

        // An adopted session runs the normal command loop
        client.get_mut().write_all(b"echo ping\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "ping\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_late_registration_during_shutdown_still_drains() {
        let server = Server::new(test_config(), CommandTable::builtin());
        server.shutdown();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let (sess, reader) = Session::new(accepted, 1).unwrap();

        // A session registering after the close sweep must notice the
        // shutdown flag and exit instead of extending the drain.
        let task = tokio::spawn(session::run(Arc::clone(&server), sess, reader));
        timeout(Duration::from_secs(2), task)
            .await
            .expect("late session should close itself during shutdown")
            .unwrap();
        assert!(server.registry().is_empty());

        timeout(Duration::from_secs(1), server.registry().wait())
            .await
            .expect("drain should complete");
    }

    #[tokio::test]
    async fn test_shutdown_trigger_reaches_run_loop() {
        let (server, _addr) = start_server().await;

        server.shutdown();
        assert!(server.is_shutdown());

        // run() notices the trigger and executes the stop sequence
        let mut stopped = server.stopped_tx.subscribe();
        timeout(Duration::from_secs(2), async {
            while !*stopped.borrow_and_update() {
                stopped.changed().await.unwrap();
            }
        })
        .await
        .expect("run loop should stop after shutdown trigger");
    }
}
