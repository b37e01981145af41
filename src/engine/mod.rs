mod availability;
mod conflict;
mod dispatch;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use availability::{
    available_after, free_windows, merge_overlapping, operating_windows, project_status,
    subtract_intervals,
};
pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;
pub use lifecycle::{can_transition, cost_for, NewBooking, Trigger};
pub use queries::BookingFilter;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::Policy;
use crate::model::*;
use crate::notify::PushPort;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start keeping a copy of every committed append until the next Compact.
    BeginSnapshot {
        response: oneshot::Sender<()>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
///
/// Between BeginSnapshot and Compact, committed events are also kept in
/// `recorded` and written after the snapshot, so nothing flushed while the
/// snapshot was being read is dropped by the swap.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut recorded: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }

                commit_batch(&mut wal, &mut batch, &mut recorded);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other, &mut recorded);
                }
            }
            other => handle_non_append(&mut wal, other, &mut recorded),
        }
    }
}

fn commit_batch(
    wal: &mut Wal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    recorded: &mut Option<Vec<Event>>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    if result.is_ok()
        && let Some(kept) = recorded.as_mut()
    {
        kept.extend(batch.iter().map(|(event, _)| event.clone()));
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, recorded: &mut Option<Vec<Event>>) {
    match cmd {
        WalCommand::BeginSnapshot { response } => {
            *recorded = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::Compact { mut events, response } => {
            if let Some(kept) = recorded.take() {
                tracing::debug!(events = kept.len(), "re-appending writes made during snapshot");
                events.extend(kept);
            }
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Booking lifecycle engine for one tenant: document store, WAL, clock and
/// the outbound push port.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) push: Arc<dyn PushPort>,
    pub(super) policy: Policy,
    pub(super) clock: Clock,
    /// Writers that update documents outside any vehicle lock hold this for
    /// reading across WAL append and apply. Compaction takes it for writing.
    pub(super) snapshot_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, push: Arc<dyn PushPort>, policy: Policy) -> io::Result<Self> {
        Self::with_clock(wal_path, push, policy, Clock::System)
    }

    pub fn with_clock(
        wal_path: PathBuf,
        push: Arc<dyn PushPort>,
        policy: Policy,
        clock: Clock,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Sole owner of every Arc during replay, so try_read/try_write always
        // succeed. Never blocking_* here: this can run inside the runtime
        // (lazy tenant creation).
        let store = InMemoryStore::new();
        for event in &events {
            store.replay(event);
        }
        tracing::debug!(path = %wal_path.display(), events = events.len(), "engine replayed");

        Ok(Self {
            store,
            wal_tx,
            push,
            policy,
            clock,
            snapshot_gate: RwLock::new(()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append a document not guarded by a vehicle lock, then apply it.
    pub(super) async fn commit<R>(
        &self,
        event: &Event,
        apply: impl FnOnce(&InMemoryStore) -> R,
    ) -> Result<R, EngineError> {
        let _gate = self.snapshot_gate.read().await;
        self.wal_append(event).await?;
        Ok(apply(&self.store))
    }

    /// WAL-append a booking document, then apply it. Caller holds the
    /// vehicle's write lock.
    pub(super) async fn persist_booking(
        &self,
        vs: &mut VehicleState,
        booking: Booking,
    ) -> Result<(), EngineError> {
        self.wal_append(&Event::BookingPut(booking.clone())).await?;
        self.store.put_booking(vs, booking);
        Ok(())
    }

    pub(super) async fn persist_vehicle(
        &self,
        vs: &mut VehicleState,
        vehicle: Vehicle,
    ) -> Result<(), EngineError> {
        self.wal_append(&Event::VehiclePut(vehicle.clone())).await?;
        vs.vehicle = vehicle;
        Ok(())
    }

    /// Acquire a vehicle's write lock, failing if it was removed while we
    /// waited.
    pub(super) async fn vehicle_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let shared = self.store.get_vehicle(id).ok_or(EngineError::NotFound(*id))?;
        let guard = shared.clone().write_owned().await;
        if !self.store.is_current_vehicle(id, &shared) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Lookup booking → vehicle, acquire the vehicle's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let retired = || match self.store.retired_booking(booking_id) {
            // Bookings on deleted vehicles are all terminal.
            Some(b) => EngineError::NotModifiable {
                id: b.id,
                status: b.status,
            },
            None => EngineError::NotFound(*booking_id),
        };
        let vehicle_id = self.store.vehicle_for_booking(booking_id).ok_or_else(retired)?;
        // The vehicle may have been retired while we waited for the lock.
        let guard = self.vehicle_write(&vehicle_id).await.map_err(|_| retired())?;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// Rewrite the WAL with only the documents needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.compaction_snapshot().await?;
        self.finish_compaction(events).await
    }

    /// Tell the writer to start recording, then read every document. Writes
    /// committed after this point are re-appended by `finish_compaction`.
    pub(super) async fn compaction_snapshot(&self) -> Result<Vec<Event>, EngineError> {
        let gate = self.snapshot_gate.write().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::BeginSnapshot { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;

        let mut events = Vec::new();
        for station in self.store.stations() {
            events.push(Event::StationPut(station));
        }
        for user in self.store.users() {
            events.push(Event::UserPut(user));
        }
        for n in self.store.all_notifications() {
            events.push(Event::NotificationPut(n));
        }
        drop(gate);

        for shared in self.store.vehicle_handles() {
            let guard = shared.read().await;
            // Deleted, or a create whose WAL append failed.
            if !self.store.is_current_vehicle(&guard.vehicle.id, &shared) {
                continue;
            }
            events.push(Event::VehiclePut(guard.vehicle.clone()));
            for b in &guard.bookings {
                events.push(Event::BookingPut(b.clone()));
            }
        }
        for b in self.store.retired_bookings() {
            events.push(Event::BookingPut(b));
        }
        Ok(events)
    }

    pub(super) async fn finish_compaction(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
