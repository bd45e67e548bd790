use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use socket2::SockRef;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::session::{AppState, ConnectionOptions, Session};

/// How long the accept loop waits for a worker report between accept polls.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Metadata failed its integrity check; all sessions were stopped.
    #[error("metadata integrity violation, server stopped")]
    IntegrityViolation,
    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct WorkerExit {
    id: u64,
    fatal: bool,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Second handle on the client socket, used to interrupt the session.
    stream: TcpStream,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
    options: ConnectionOptions,
    stop: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(addr: impl ToSocketAddrs, state: Arc<AppState>, options: ConnectionOptions) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, state, options, stop: Arc::new(AtomicBool::new(false)) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.stop.clone())
    }

    /// Accept connections until shut down or until a session reports an
    /// integrity violation. In-flight sessions are stopped and joined
    /// before returning.
    pub fn run(self) -> Result<(), ServerError> {
        info!("sharebox server listening on {}", self.local_addr()?);
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let mut workers: HashMap<u64, Worker> = HashMap::new();
        let mut next_id: u64 = 0;
        let mut fail_stop = false;

        loop {
            while let Ok(exit) = exit_rx.try_recv() {
                fail_stop |= reap(&mut workers, exit);
            }
            if fail_stop || self.state.metadata.integrity().is_tripped() {
                fail_stop = true;
                break;
            }
            if self.stop.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                break;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    next_id += 1;
                    match self.spawn_worker(next_id, stream, peer, exit_tx.clone()) {
                        Ok(worker) => {
                            workers.insert(next_id, worker);
                        }
                        Err(e) => warn!("Failed to start session for {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Ok(exit) = exit_rx.recv_timeout(POLL_INTERVAL) {
                        fail_stop |= reap(&mut workers, exit);
                    }
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }

        drop(self.listener);
        stop_workers(workers, &exit_rx);

        if fail_stop {
            error!("Server stopped after an integrity violation");
            return Err(ServerError::IntegrityViolation);
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn_worker(
        &self,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        exit_tx: Sender<WorkerExit>,
    ) -> io::Result<Worker> {
        stream.set_nonblocking(false)?;
        let sock = SockRef::from(&stream);
        sock.set_nodelay(true)?;
        sock.set_keepalive(true)?;
        stream.set_read_timeout(self.options.socket_timeout)?;
        stream.set_write_timeout(self.options.socket_timeout)?;
        let control = stream.try_clone()?;

        let state = self.state.clone();
        let options = self.options;
        let handle = std::thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let span = info_span!("session", id = %Uuid::new_v4(), peer = %peer);
                let _enter = span.enter();
                info!("Connection accepted");

                let fatal = match Session::new(stream, peer.to_string(), state, options).run() {
                    Ok(()) => false,
                    Err(e) if e.is_fatal() => {
                        error!("Session hit a fatal error: {}", e);
                        true
                    }
                    Err(e) => {
                        warn!("Session ended: {}", e);
                        false
                    }
                };
                let _ = exit_tx.send(WorkerExit { id, fatal });
            })?;

        Ok(Worker { handle, stream: control })
    }
}

/// Join a finished worker. Returns whether it reported a fatal error.
fn reap(workers: &mut HashMap<u64, Worker>, exit: WorkerExit) -> bool {
    if let Some(worker) = workers.remove(&exit.id) {
        if worker.handle.join().is_err() {
            error!("Session thread {} panicked", exit.id);
        }
    }
    debug!("Session {} finished ({} active)", exit.id, workers.len());
    exit.fatal
}

fn stop_workers(workers: HashMap<u64, Worker>, exit_rx: &Receiver<WorkerExit>) {
    if workers.is_empty() {
        return;
    }
    info!("Stopping {} active sessions", workers.len());
    for worker in workers.values() {
        let _ = worker.stream.shutdown(Shutdown::Both);
    }
    for (id, worker) in workers {
        if worker.handle.join().is_err() {
            error!("Session thread {} panicked", id);
        }
    }
    // Reports from the stopped sessions are no longer needed.
    while exit_rx.try_recv().is_ok() {}
}
