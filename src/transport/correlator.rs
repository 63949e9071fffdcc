//! Request/response correlation over one stream connection
//!
//! Every command becomes a `PendingCommand` keyed by its correlation id. The
//! dispatcher task matches inbound frames against the table; the caller's own
//! deadline settles the entry with `CommandTimeout` when nothing matched in
//! time. Settling consumes the `PendingCommand`, and the table only hands one
//! out while its lock is held, so an entry is settled exactly once.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, TransportEvent};
use super::FrameSink;
use crate::adapters::traits::{CorrelationMode, FrameCodec};
use crate::error::{DeviceError, Result};

/// A command waiting for its reply. Dropping out of the table by `settle`
/// is the only way it leaves the pending state.
struct PendingCommand<R> {
    payload: Vec<u8>,
    deadline: Instant,
    tx: oneshot::Sender<Result<R>>,
}

impl<R> PendingCommand<R> {
    /// Pending -> Settled. Consumes the entry, so it cannot happen twice.
    fn settle(self, outcome: Result<R>) {
        if self.tx.send(outcome).is_err() {
            tracing::trace!("Caller went away before its reply was delivered");
        }
    }
}

struct TableState<R> {
    entries: BTreeMap<u64, PendingCommand<R>>,
    closed: Option<String>,
}

/// Pending-command table shared by callers and the dispatcher.
struct PendingTable<R> {
    peer: String,
    state: Mutex<TableState<R>>,
}

impl<R> PendingTable<R> {
    fn new(peer: String) -> Self {
        Self {
            peer,
            state: Mutex::new(TableState {
                entries: BTreeMap::new(),
                closed: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        id: u64,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<R>>> {
        let mut state = self.state();
        if let Some(reason) = &state.closed {
            return Err(DeviceError::connectivity(&self.peer, reason));
        }
        let (tx, rx) = oneshot::channel();
        state.entries.insert(
            id,
            PendingCommand {
                payload,
                deadline,
                tx,
            },
        );
        Ok(rx)
    }

    /// Settle `id` if it is still pending. Returns false for unknown ids.
    fn settle(&self, id: u64, outcome: Result<R>) -> bool {
        let mut state = self.state();
        match state.entries.remove(&id) {
            Some(pending) => {
                pending.settle(outcome);
                true
            }
            None => false,
        }
    }

    fn oldest(&self) -> Option<u64> {
        self.state().entries.keys().next().copied()
    }

    /// Settle every outstanding entry with a connectivity error and refuse
    /// new registrations. Returns how many entries were failed.
    fn close(&self, reason: &str) -> usize {
        let mut state = self.state();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
        let drained = std::mem::take(&mut state.entries);
        let count = drained.len();
        for (id, pending) in drained {
            tracing::debug!(
                "Failing command {} to {} ({} bytes, {:?} before deadline): {}",
                id,
                self.peer,
                pending.payload.len(),
                pending.deadline.saturating_duration_since(Instant::now()),
                reason
            );
            pending.settle(Err(DeviceError::connectivity(&self.peer, reason)));
        }
        count
    }

    fn len(&self) -> usize {
        self.state().entries.len()
    }

    fn is_closed(&self) -> bool {
        self.state().closed.is_some()
    }

    fn contains(&self, id: u64) -> bool {
        self.state().entries.contains_key(&id)
    }
}

/// Removes the entry if the caller's future is dropped before settlement.
struct PendingGuard<'a, R> {
    table: &'a PendingTable<R>,
    id: u64,
}

impl<R> Drop for PendingGuard<'_, R> {
    fn drop(&mut self) {
        // No-op when the entry was already settled
        self.table.settle(
            self.id,
            Err(DeviceError::connectivity(&self.table.peer, "command cancelled")),
        );
    }
}

/// Correlates commands and replies for one connection.
pub struct Correlator<C: FrameCodec> {
    codec: Arc<C>,
    sink: Arc<dyn FrameSink>,
    table: Arc<PendingTable<C::Reply>>,
    next_id: AtomicU64,
    /// Admits one command at a time for `Serial` codecs
    turnstile: tokio::sync::Mutex<()>,
    lost: CancellationToken,
}

impl<C: FrameCodec> Correlator<C> {
    /// Open a connection with the codec's terminator and start correlating.
    pub async fn open(
        codec: Arc<C>,
        address: IpAddr,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let (connection, events) =
            Connection::open(address, port, connect_timeout, codec.terminator()).await?;
        Ok(Self::start(codec, Arc::new(connection), events))
    }

    /// Start correlating frames from `events` for commands written to `sink`.
    pub fn start(
        codec: Arc<C>,
        sink: Arc<dyn FrameSink>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let table = Arc::new(PendingTable::new(sink.peer().to_string()));
        let lost = CancellationToken::new();

        tokio::spawn(dispatch(codec.clone(), table.clone(), events, lost.clone()));

        Self {
            codec,
            sink,
            table,
            next_id: AtomicU64::new(1),
            turnstile: tokio::sync::Mutex::new(()),
            lost,
        }
    }

    pub fn peer(&self) -> &str {
        self.sink.peer()
    }

    /// Send `request` and wait up to `deadline` for its reply. The deadline
    /// covers the write as well as the wait.
    ///
    /// Encoding errors (including local range validation) return before
    /// anything is registered or written.
    pub async fn send_command(&self, request: &C::Request, deadline: Duration) -> Result<C::Reply> {
        let _turn = match self.codec.correlation() {
            CorrelationMode::Serial => Some(self.turnstile.lock().await),
            CorrelationMode::ById => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.encode(request, id)?;

        let expires = Instant::now() + deadline;
        let mut rx = self.table.register(id, frame.clone(), expires)?;
        let _guard = PendingGuard {
            table: self.table.as_ref(),
            id,
        };

        match timeout_at(expires, self.sink.send_frame(&frame)).await {
            Ok(sent) => sent?,
            Err(_) => {
                // A partial frame may be on the wire; nothing after it can be trusted
                self.retire("write stalled past the command deadline");
                return Err(DeviceError::CommandTimeout { after: deadline });
            }
        }

        match timeout_at(expires, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DeviceError::connectivity(self.peer(), "correlator stopped")),
            Err(_) => {
                // Either our timeout wins here or a reply already settled it
                let timed_out = self
                    .table
                    .settle(id, Err(DeviceError::CommandTimeout { after: deadline }));
                if timed_out
                    && self.codec.correlation() == CorrelationMode::Serial
                    && !self.codec.echoes_id()
                {
                    self.retire("unanswered command on a link without reply ids");
                }
                rx.try_recv().unwrap_or_else(|_| {
                    Err(DeviceError::connectivity(self.peer(), "correlator stopped"))
                })
            }
        }
    }

    /// Stop accepting commands without closing the socket. The owner closes
    /// it and opens a fresh link.
    fn retire(&self, reason: &str) {
        tracing::warn!("{}: {}; link retired", self.peer(), reason);
        self.table.close(reason);
    }

    /// False once the link has closed or been retired after a timeout it
    /// cannot recover from.
    pub fn accepts_commands(&self) -> bool {
        !self.table.is_closed()
    }

    /// Number of commands still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.table.contains(id)
    }

    /// True once the underlying connection has failed or been closed.
    pub fn is_closed(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Token cancelled when the connection ends for any reason.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Fail every outstanding command and release the connection.
    pub fn shutdown(&self) -> usize {
        let failed = self.table.close("connection closed");
        self.sink.close();
        failed
    }
}

impl<C: FrameCodec> Drop for Correlator<C> {
    fn drop(&mut self) {
        self.table.close("connection dropped");
        self.sink.close();
    }
}

async fn dispatch<C: FrameCodec>(
    codec: Arc<C>,
    table: Arc<PendingTable<C::Reply>>,
    mut events: mpsc::Receiver<TransportEvent>,
    lost: CancellationToken,
) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Frame(frame)) => {
                let target = match codec.correlation() {
                    CorrelationMode::ById => codec.correlation_id(&frame),
                    CorrelationMode::Serial => table.oldest().filter(|&id| {
                        !matches!(
                            codec.correlation_id(&frame),
                            Some(echoed) if echoed != codec.wire_id(id)
                        )
                    }),
                };
                let settled = match target {
                    Some(id) => table.settle(id, codec.decode(&frame)),
                    None => false,
                };
                if !settled {
                    tracing::debug!(
                        "Discarding unsolicited message from {}: {}",
                        table.peer,
                        String::from_utf8_lossy(&frame)
                    );
                }
            }
            Some(TransportEvent::Closed(reason)) => break reason,
            None => break "transport stopped".to_string(),
        }
    };

    let failed = table.close(&reason);
    if failed > 0 {
        tracing::warn!(
            "Connection to {} lost with {} command(s) outstanding: {}",
            table.peer,
            failed,
            reason
        );
    }
    lost.cancel();
}
