use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability;

/// How often each periodic scan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepIntervals {
    pub unconfirmed: Duration,
    pub payment: Duration,
    pub reminders: Duration,
    pub inbox: Duration,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            unconfirmed: Duration::from_secs(5 * 60),
            payment: Duration::from_secs(60),
            reminders: Duration::from_secs(60),
            inbox: Duration::from_secs(60 * 60),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Background task driving every time-based expiry for one tenant.
pub async fn run_sweeper(engine: Arc<Engine>, intervals: SweepIntervals) {
    let mut unconfirmed = ticker(intervals.unconfirmed);
    let mut payment = ticker(intervals.payment);
    let mut reminders = ticker(intervals.reminders);
    let mut inbox = ticker(intervals.inbox);
    loop {
        tokio::select! {
            _ = unconfirmed.tick() => { sweep_unconfirmed(&engine).await; }
            _ = payment.tick() => { sweep_unpaid(&engine).await; }
            _ = reminders.tick() => { sweep_reminders(&engine).await; }
            _ = inbox.tick() => { sweep_inbox(&engine).await; }
        }
    }
}

/// A booking the scan picked up may have moved on before we got its lock.
fn raced(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::IllegalTransition { .. }
            | EngineError::NotExpired(_)
            | EngineError::NotFound(_)
            | EngineError::NotModifiable { .. }
    )
}

/// Cancel pending bookings nobody confirmed in time. Returns how many
/// were cancelled.
pub async fn sweep_unconfirmed(engine: &Engine) -> usize {
    let due = engine.collect_unconfirmed_expired(engine.now()).await;
    let mut cancelled = 0;
    for id in due {
        match engine.expire_unconfirmed(id).await {
            Ok(_) => {
                cancelled += 1;
                metrics::counter!(observability::SWEEPER_CANCELLATIONS_TOTAL, "reason" => "unconfirmed")
                    .increment(1);
                info!(booking = %id, "expired unconfirmed booking");
            }
            Err(e) if raced(&e) => debug!(booking = %id, error = %e, "unconfirmed sweep skip"),
            Err(e) => warn!(booking = %id, error = %e, "unconfirmed sweep failed"),
        }
    }
    cancelled
}

/// Cancel confirmed bookings whose payment window closed.
pub async fn sweep_unpaid(engine: &Engine) -> usize {
    let due = engine.collect_payment_expired(engine.now()).await;
    let mut cancelled = 0;
    for id in due {
        match engine.expire_unpaid(id).await {
            Ok(_) => {
                cancelled += 1;
                metrics::counter!(observability::SWEEPER_CANCELLATIONS_TOTAL, "reason" => "payment_timeout")
                    .increment(1);
                info!(booking = %id, "cancelled unpaid booking");
            }
            Err(e) if raced(&e) => debug!(booking = %id, error = %e, "payment sweep skip"),
            Err(e) => warn!(booking = %id, error = %e, "payment sweep failed"),
        }
    }
    cancelled
}

pub async fn sweep_reminders(engine: &Engine) -> usize {
    let due = engine.collect_due_reminders(engine.now()).await;
    let mut sent = 0;
    for id in due {
        match engine.send_reminder(id).await {
            Ok(Some(_)) => {
                sent += 1;
                metrics::counter!(observability::REMINDERS_SENT_TOTAL).increment(1);
            }
            Ok(None) => debug!(booking = %id, "reminder no longer due"),
            Err(e) if raced(&e) => debug!(booking = %id, error = %e, "reminder sweep skip"),
            Err(e) => warn!(booking = %id, error = %e, "reminder sweep failed"),
        }
    }
    sent
}

pub async fn sweep_inbox(engine: &Engine) -> usize {
    match engine.purge_expired_notifications(engine.now()).await {
        Ok(0) => 0,
        Ok(n) => {
            info!(purged = n, "expired notifications purged");
            n
        }
        Err(e) => {
            warn!(error = %e, "notification purge failed");
            0
        }
    }
}

/// Background task that compacts the WAL when enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = ticker(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!(appends, "WAL compacted"),
                Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::engine::NewBooking;
    use crate::limits::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use tokio_test::{assert_err, assert_ok};
    use ulid::Ulid;

    const T0: Ms = 1_767_225_600_000 + 8 * HOUR_MS;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("evfleet_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Setup {
        engine: Engine,
        customer: Ulid,
        vehicle: Ulid,
    }

    async fn setup(name: &str) -> Setup {
        let engine = Engine::with_clock(
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            Policy::default(),
            Clock::manual(T0),
        )
        .unwrap();
        let station = Ulid::new();
        engine
            .create_station(station, "North".into(), "Ring Rd".into())
            .await
            .unwrap();
        engine
            .register_user(Ulid::new(), "Kim".into(), Role::StationMaster { station_id: station })
            .await
            .unwrap();
        let customer = Ulid::new();
        engine
            .register_user(customer, "Ari".into(), Role::Customer)
            .await
            .unwrap();
        let vehicle = Ulid::new();
        engine
            .create_vehicle(vehicle, station, "Niro".into(), 1_000, None)
            .await
            .unwrap();
        Setup {
            engine,
            customer,
            vehicle,
        }
    }

    async fn book(s: &Setup, start: Ms) -> Booking {
        s.engine
            .create_booking(NewBooking {
                id: Ulid::new(),
                user_id: s.customer,
                vehicle_id: s.vehicle,
                station_id: None,
                start,
                end: start + 2 * HOUR_MS,
                emergency_contacts: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unconfirmed_sweep_is_idempotent() {
        let s = setup("unconfirmed_idempotent.wal").await;
        let stale = book(&s, T0 + 2 * HOUR_MS).await;
        s.engine.clock().advance(10 * MINUTE_MS);
        let fresh = book(&s, T0 + 5 * HOUR_MS).await;

        s.engine.clock().advance(6 * MINUTE_MS);
        assert_eq!(sweep_unconfirmed(&s.engine).await, 1);
        assert_eq!(sweep_unconfirmed(&s.engine).await, 0);

        let stale = s.engine.get_booking(stale.id).await.unwrap();
        assert_eq!(stale.status, BookingStatus::Cancelled);
        assert_eq!(stale.version, 2);
        let fresh = s.engine.get_booking(fresh.id).await.unwrap();
        assert_eq!(fresh.status, BookingStatus::PendingConfirmation);
    }

    #[tokio::test]
    async fn payment_sweep_cancels_only_unpaid() {
        let s = setup("payment_sweep.wal").await;
        let unpaid = book(&s, T0 + 2 * HOUR_MS).await;
        let paid = book(&s, T0 + 5 * HOUR_MS).await;
        for b in [&unpaid, &paid] {
            assert_ok!(
                s.engine
                    .update_booking_status(b.id, BookingStatus::Confirmed, None)
                    .await
            );
        }
        assert_ok!(
            s.engine
                .record_payment(paid.id, PaymentStatus::Completed, Some("pi_9".into()))
                .await
        );

        s.engine.clock().advance(16 * MINUTE_MS);
        assert_eq!(sweep_unpaid(&s.engine).await, 1);
        assert_eq!(sweep_unpaid(&s.engine).await, 0);

        let unpaid = s.engine.get_booking(unpaid.id).await.unwrap();
        assert_eq!(unpaid.payment_status, PaymentStatus::Failed);
        assert_eq!(unpaid.cancel_reason, Some(CancelReason::PaymentTimeout));
        assert_eq!(
            s.engine.get_booking(paid.id).await.unwrap().status,
            BookingStatus::Confirmed
        );
        assert_err!(s.engine.expire_unpaid(paid.id).await);
    }

    #[tokio::test]
    async fn reminder_sweep_sends_once() {
        let s = setup("reminder_sweep.wal").await;
        book(&s, T0 + HOUR_MS + 30 * MINUTE_MS).await;
        assert_eq!(sweep_reminders(&s.engine).await, 0);
        s.engine.clock().advance(30 * MINUTE_MS);
        assert_eq!(sweep_reminders(&s.engine).await, 1);
        assert_eq!(sweep_reminders(&s.engine).await, 0);
    }

    #[tokio::test]
    async fn inbox_sweep_purges_old_records() {
        let s = setup("inbox_sweep.wal").await;
        book(&s, T0 + 2 * HOUR_MS).await;
        assert_eq!(sweep_inbox(&s.engine).await, 0);
        s.engine.clock().advance(DEFAULT_NOTIFICATION_TTL_MS);
        assert_eq!(sweep_inbox(&s.engine).await, 1);
        assert_eq!(s.engine.list_notifications(s.customer, 1, 20).total, 0);
    }
}
