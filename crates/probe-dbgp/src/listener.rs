//! Background accept loop.
//!
//! A [`Listener`] waits for an engine on a dedicated thread so the
//! foreground control loop stays responsive. At most one connection is
//! ever pending; taking it stops the background wait for good. The
//! accept thread exits as soon as it has either accepted a peer or run
//! out its window, so the foreground take can never race it.

use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::DbgpError;

/// How often the accept thread re-checks for a peer or a stop request.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Readiness of the background accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Not waiting and nothing pending.
    Inactive,
    /// The background thread is waiting for an engine.
    Listening,
    /// An engine has connected and is waiting to be taken.
    Ready,
    /// The accept window lapsed with no engine; not yet reported.
    TimedOut,
}

/// State shared with the accept thread.
#[derive(Debug)]
struct Shared {
    pending: Mutex<Option<TcpStream>>,
    stop: AtomicBool,
    timed_out: AtomicBool,
    done: AtomicBool,
}

/// Accepts one engine connection in the background.
#[derive(Debug, Default)]
pub struct Listener {
    shared: Option<Arc<Shared>>,
    handle: Option<JoinHandle<()>>,
    timeout_reported: bool,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for an engine on `host:port`.
    ///
    /// Binding happens here so address errors surface immediately; only
    /// the accept wait moves to the background. Calling `start` while
    /// already listening is a no-op.
    pub fn start(&mut self, host: &str, port: u16, timeout: Duration) -> Result<(), DbgpError> {
        match self.status() {
            ListenerStatus::Listening | ListenerStatus::Ready => return Ok(()),
            ListenerStatus::Inactive | ListenerStatus::TimedOut => {}
        }
        self.reap();

        let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
        let server = TcpListener::bind((bind_host, port))?;
        server.set_nonblocking(true)?;
        debug!("listening for an engine on {bind_host}:{port}");

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            stop: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || accept_loop(server, thread_shared, timeout));

        self.shared = Some(shared);
        self.handle = Some(handle);
        self.timeout_reported = false;
        Ok(())
    }

    /// Current readiness.
    pub fn status(&self) -> ListenerStatus {
        let Some(shared) = &self.shared else {
            return ListenerStatus::Inactive;
        };
        if shared.pending.lock().expect("listener lock").is_some() {
            return ListenerStatus::Ready;
        }
        if !shared.done.load(Ordering::Acquire) {
            return ListenerStatus::Listening;
        }
        if shared.timed_out.load(Ordering::Acquire) && !self.timeout_reported {
            return ListenerStatus::TimedOut;
        }
        ListenerStatus::Inactive
    }

    /// Whether the background thread is still waiting.
    pub fn is_listening(&self) -> bool {
        self.status() == ListenerStatus::Listening
    }

    /// Whether a connection is pending.
    pub fn is_ready(&self) -> bool {
        self.status() == ListenerStatus::Ready
    }

    /// Non-blocking readiness check.
    ///
    /// Returns the accepted connection exactly once, a timeout error
    /// exactly once after the accept window lapses, and `None` while the
    /// wait continues (or nothing is in flight).
    pub fn poll(&mut self) -> Result<Option<Connection>, DbgpError> {
        let Some(shared) = self.shared.as_ref().map(Arc::clone) else {
            return Ok(None);
        };

        let taken = shared.pending.lock().expect("listener lock").take();
        if let Some(stream) = taken {
            self.reap();
            self.shared = None;
            return Ok(Some(Connection::from_stream(stream)));
        }

        if shared.done.load(Ordering::Acquire)
            && shared.timed_out.load(Ordering::Acquire)
            && !self.timeout_reported
        {
            self.timeout_reported = true;
            self.reap();
            self.shared = None;
            return Err(DbgpError::timeout("connection"));
        }
        Ok(None)
    }

    /// Cancel the wait. Joins the background thread; any pending,
    /// never-taken connection is dropped (and thereby closed).
    pub fn stop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.stop.store(true, Ordering::Release);
        }
        self.reap();
        self.shared = None;
        self.timeout_reported = false;
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(server: TcpListener, shared: Arc<Shared>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if shared.stop.load(Ordering::Acquire) {
            debug!("accept wait cancelled");
            break;
        }
        match server.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    warn!("could not restore blocking mode on accepted socket");
                }
                debug!("engine connected from {peer}");
                *shared.pending.lock().expect("listener lock") = Some(stream);
                break;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    debug!("accept wait timed out");
                    shared.timed_out.store(true, Ordering::Release);
                    break;
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL.min(timeout));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                shared.timed_out.store(true, Ordering::Release);
                break;
            }
        }
    }
    shared.done.store(true, Ordering::Release);
    // The server socket drops here; nothing keeps listening.
}
