//! Shared connection lifecycle.
//!
//! One `SharedConnection` per process owns the handle every request uses.
//! The handle is opened lazily by the first caller; callers that arrive
//! while it is opening get the same handle back and wait on it instead of
//! opening their own. A handle found `Closing`/`Closed` is replaced with a
//! fresh one through an atomic compare-and-swap, so concurrent reconnects
//! converge on a single handle.
//!
//! There is no retry loop: a failed open leaves the handle `Closed`, and the
//! next `acquire()` reconstructs it. An open abandoned mid-flight (the
//! caller's future was dropped) counts as a failed open.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use kvs_core::{Error, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Opens transport connections to the backing store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A cheaply cloneable, multiplexed connection.
    type Connection: Clone + Send + Sync + 'static;

    /// Human-readable target for log records. Must not contain credentials.
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// A transport error reported against a handle.
#[derive(Debug, Clone)]
pub struct ConnectionFault {
    pub endpoint: String,
    pub generation: u64,
    pub cause: String,
}

type ErrorCallback = Arc<dyn Fn(&ConnectionFault) + Send + Sync>;

// ── ConnectionHandle ─────────────────────────────────────────────────

pub struct ConnectionHandle<T> {
    generation: u64,
    endpoint: String,
    state: watch::Sender<ConnectionState>,
    conn: OnceLock<T>,
    on_error: ErrorCallback,
}

impl<T> fmt::Debug for ConnectionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T: Clone> ConnectionHandle<T> {
    fn new(generation: u64, endpoint: String, on_error: ErrorCallback) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            generation,
            endpoint,
            state,
            conn: OnceLock::new(),
            on_error,
        }
    }

    /// Increments every time the manager constructs a new handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The open connection. Waits while another caller is still opening
    /// the handle.
    pub async fn connection(&self) -> Result<T> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| {
                !matches!(s, ConnectionState::Uninitialized | ConnectionState::Opening)
            })
            .await
            .map_err(|_| Error::Connection(format!("handle for {} was dropped", self.endpoint)))?;

        match (state, self.conn.get()) {
            (ConnectionState::Open, Some(conn)) => Ok(conn.clone()),
            _ => Err(Error::Connection(format!(
                "connection to {} is {state:?}",
                self.endpoint
            ))),
        }
    }

    /// Mark the handle dead after a transport error and notify the
    /// registered callback. Repeated reports for a dead handle are ignored.
    pub fn report_error(&self, cause: impl Into<String>) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        (self.on_error)(&ConnectionFault {
            endpoint: self.endpoint.clone(),
            generation: self.generation,
            cause: cause.into(),
        });
    }

    pub fn close(&self) {
        let closing = self.state.send_if_modified(|s| {
            if matches!(s, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            *s = ConnectionState::Closing;
            true
        });
        if closing {
            self.state.send_replace(ConnectionState::Closed);
        }
    }

    /// Claim the right to open this handle. Exactly one caller wins.
    fn begin_open(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s != ConnectionState::Uninitialized {
                return false;
            }
            *s = ConnectionState::Opening;
            true
        })
    }

    fn finish_open(&self, conn: T) {
        let _ = self.conn.set(conn);
        self.state.send_replace(ConnectionState::Open);
    }

    fn fail_open(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Closes a handle left in `Opening` when the open is dropped before it
/// completes, releasing everyone waiting in `connection()`.
struct OpenGuard<'a, T: Clone> {
    handle: &'a ConnectionHandle<T>,
    armed: bool,
}

impl<'a, T: Clone> OpenGuard<'a, T> {
    fn new(handle: &'a ConnectionHandle<T>) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    fn finish(mut self, conn: T) {
        self.armed = false;
        self.handle.finish_open(conn);
    }
}

impl<T: Clone> Drop for OpenGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.handle.fail_open();
        }
    }
}

// ── SharedConnection ─────────────────────────────────────────────────

/// Process-wide owner of the current connection handle.
pub struct SharedConnection<C: Connector> {
    connector: C,
    current: ArcSwapOption<ConnectionHandle<C::Connection>>,
    generation: AtomicU64,
    connect_timeout: Duration,
    /// Turn reported faults into a `Provider` error on the next acquire.
    surface_faults: bool,
    pending_fault: Arc<Mutex<Option<ConnectionFault>>>,
}

impl<C: Connector> SharedConnection<C> {
    pub fn new(connector: C, connect_timeout: Duration, surface_faults: bool) -> Self {
        Self {
            connector,
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            connect_timeout,
            surface_faults,
            pending_fault: Arc::new(Mutex::new(None)),
        }
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// State of the current handle; `Uninitialized` before first use.
    pub fn state(&self) -> ConnectionState {
        self.current
            .load_full()
            .map_or(ConnectionState::Uninitialized, |h| h.state())
    }

    /// Return a usable handle, opening or reconstructing it as needed.
    pub async fn acquire(&self) -> Result<Arc<ConnectionHandle<C::Connection>>> {
        if let Some(fault) = self.take_fault() {
            warn!(
                endpoint = %fault.endpoint,
                generation = fault.generation,
                cause = %fault.cause,
                "surfacing earlier connection fault"
            );
            return Err(Error::Provider);
        }

        let handle = match self.current.load_full() {
            Some(handle) => handle,
            None => self.replace(None),
        };

        let handle = match handle.state() {
            ConnectionState::Opening => return Ok(handle),
            ConnectionState::Closing | ConnectionState::Closed => self.replace(Some(handle)),
            ConnectionState::Uninitialized | ConnectionState::Open => handle,
        };

        if handle.begin_open() {
            self.open(&handle).await?;
        }
        Ok(handle)
    }

    /// Close and drop the current handle. A later `acquire()` starts over.
    pub fn shutdown(&self) {
        if let Some(handle) = self.current.swap(None) {
            handle.close();
            info!(
                endpoint = %handle.endpoint(),
                generation = handle.generation(),
                "backing store connection closed"
            );
        }
    }

    async fn open(&self, handle: &ConnectionHandle<C::Connection>) -> Result<()> {
        debug!(
            endpoint = %handle.endpoint(),
            generation = handle.generation(),
            "opening backing store connection"
        );
        let guard = OpenGuard::new(handle);
        match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => {
                guard.finish(conn);
                info!(
                    endpoint = %handle.endpoint(),
                    generation = handle.generation(),
                    "backing store connection open"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                drop(guard);
                warn!(endpoint = %handle.endpoint(), error = %e, "backing store connection failed");
                Err(match e {
                    Error::Connection(_) => e,
                    other => Error::Connection(other.to_string()),
                })
            }
            Err(_) => {
                drop(guard);
                warn!(
                    endpoint = %handle.endpoint(),
                    timeout = ?self.connect_timeout,
                    "backing store connection timed out"
                );
                Err(Error::Connection(format!(
                    "opening {} timed out after {:?}",
                    handle.endpoint(),
                    self.connect_timeout
                )))
            }
        }
    }

    /// Install a fresh handle in place of `stale`. If another caller already
    /// replaced it, that caller's handle is returned instead.
    fn replace(
        &self,
        stale: Option<Arc<ConnectionHandle<C::Connection>>>,
    ) -> Arc<ConnectionHandle<C::Connection>> {
        let fresh = Arc::new(self.construct());
        let previous = self.current.compare_and_swap(&stale, Some(Arc::clone(&fresh)));

        let swapped = match (&*previous, &stale) {
            (Some(prev), Some(stale)) => Arc::ptr_eq(prev, stale),
            (None, None) => true,
            _ => false,
        };
        if swapped {
            if let Some(stale) = &stale {
                debug!(
                    retired = stale.generation(),
                    generation = fresh.generation(),
                    "replaced dead connection handle"
                );
            }
            return fresh;
        }

        match &*previous {
            Some(winner) => Arc::clone(winner),
            // Shut down concurrently; install into the empty slot.
            None => self.replace(None),
        }
    }

    fn construct(&self) -> ConnectionHandle<C::Connection> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = self.surface_faults.then(|| Arc::clone(&self.pending_fault));
        let on_error: ErrorCallback = Arc::new(move |fault: &ConnectionFault| {
            error!(
                endpoint = %fault.endpoint,
                generation = fault.generation,
                cause = %fault.cause,
                "backing store connection fault"
            );
            if let Some(pending) = &pending {
                *pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault.clone());
            }
        });
        ConnectionHandle::new(generation, self.connector.endpoint(), on_error)
    }

    fn take_fault(&self) -> Option<ConnectionFault> {
        self.pending_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
