use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::project_status;
use super::conflict::{
    check_duration, check_no_conflict, check_operating_hours, validate_request, validate_span,
};
use super::dispatch::{modification_notice, payment_notice, transition_notice};
use super::{Engine, EngineError};

/// Who or what is asking for a transition. Timeouts and admin overrides
/// carry extra guards and pick the cancellation reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Station staff, or a super-admin acting as staff.
    Staff,
    /// Super-admin emergency cancel of a confirmed or active booking.
    AdminOverride,
    UnconfirmedTimeout,
    PaymentTimeout,
}

impl Trigger {
    fn cancel_reason(self) -> CancelReason {
        match self {
            Trigger::Staff => CancelReason::Manual,
            Trigger::AdminOverride => CancelReason::AdminOverride,
            Trigger::UnconfirmedTimeout => CancelReason::Unconfirmed,
            Trigger::PaymentTimeout => CancelReason::PaymentTimeout,
        }
    }
}

/// The transition table. Terminal states have no exits.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (PendingConfirmation, Confirmed)
            | (PendingConfirmation, Cancelled)
            | (Confirmed, Active)
            | (Confirmed, Cancelled)
            | (Active, Completed)
            | (Active, Cancelled)
    )
}

/// Price of `duration_ms` at an hourly rate, rounded to the nearest cent.
/// Negative durations give negative amounts (used for shortening).
pub fn cost_for(duration_ms: Ms, price_per_hour: Cents) -> Cents {
    let hour = HOUR_MS as i128;
    let magnitude = (duration_ms.unsigned_abs() as i128 * price_per_hour as i128 + hour / 2) / hour;
    let magnitude = magnitude as Cents;
    if duration_ms < 0 { -magnitude } else { magnitude }
}

pub(crate) fn unconfirmed_expired(b: &Booking, policy: &Policy, now: Ms) -> bool {
    b.status == BookingStatus::PendingConfirmation && b.created_at + policy.unconfirmed_ttl_ms < now
}

pub(crate) fn payment_expired(b: &Booking, now: Ms) -> bool {
    b.status == BookingStatus::Confirmed
        && b.payment_status != PaymentStatus::Completed
        && b.payment_deadline.is_some_and(|d| d < now)
}

pub(crate) fn reminder_due(b: &Booking, policy: &Policy, now: Ms) -> bool {
    matches!(b.status, BookingStatus::PendingConfirmation | BookingStatus::Confirmed)
        && !b.reminder_sent
        && b.span.start > now
        && b.span.start - now <= policy.reminder_lead_ms
}

/// Compute the post-transition booking, or the guard that failed.
/// Pure: nothing is written here.
pub(crate) fn plan_transition(
    current: &Booking,
    to: BookingStatus,
    trigger: Trigger,
    now: Ms,
    policy: &Policy,
) -> Result<Booking, EngineError> {
    let from = current.status;
    let illegal = EngineError::IllegalTransition { from, to };
    if !can_transition(from, to) {
        return Err(illegal);
    }

    match trigger {
        Trigger::Staff => {}
        Trigger::AdminOverride => {
            if to != BookingStatus::Cancelled
                || !matches!(from, BookingStatus::Confirmed | BookingStatus::Active)
            {
                return Err(illegal);
            }
        }
        Trigger::UnconfirmedTimeout => {
            if from != BookingStatus::PendingConfirmation || to != BookingStatus::Cancelled {
                return Err(illegal);
            }
            if !unconfirmed_expired(current, policy, now) {
                return Err(EngineError::NotExpired(current.id));
            }
        }
        Trigger::PaymentTimeout => {
            if from != BookingStatus::Confirmed || to != BookingStatus::Cancelled {
                return Err(illegal);
            }
            if !payment_expired(current, now) {
                return Err(EngineError::NotExpired(current.id));
            }
        }
    }

    if to == BookingStatus::Active && current.payment_status != PaymentStatus::Completed {
        return Err(EngineError::PaymentRequired);
    }

    let mut next = current.clone();
    next.status = to;
    next.updated_at = now;
    next.version += 1;
    match to {
        BookingStatus::Confirmed => next.payment_deadline = Some(now + policy.payment_window_ms),
        BookingStatus::Cancelled => {
            next.cancel_reason = Some(trigger.cancel_reason());
            if trigger == Trigger::PaymentTimeout {
                next.payment_status = PaymentStatus::Failed;
            }
        }
        _ => {}
    }
    Ok(next)
}

/// A booking request from an authorized caller.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub vehicle_id: Ulid,
    /// Must match the vehicle's station when given.
    pub station_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub emergency_contacts: Vec<String>,
}

fn check_contacts(contacts: &[String]) -> Result<(), EngineError> {
    if contacts.len() > MAX_EMERGENCY_CONTACTS {
        return Err(EngineError::LimitExceeded("too many emergency contacts"));
    }
    for c in contacts {
        if c.trim().is_empty() {
            return Err(EngineError::validation("emergency contact cannot be empty"));
        }
        if c.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("emergency contact too long"));
        }
    }
    Ok(())
}

impl Engine {
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let now = self.now();
        let span = validate_span(req.start, req.end)?;
        validate_request(&self.policy, &span, now)?;
        check_contacts(&req.emergency_contacts)?;

        let user = self
            .store
            .user(&req.user_id)
            .ok_or(EngineError::NotFound(req.user_id))?;
        if !user.active {
            return Err(EngineError::validation("user account is deactivated"));
        }
        if self.store.contains_booking(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let mut guard = self.vehicle_write(&req.vehicle_id).await?;
        let vehicle = &guard.vehicle;
        if let Some(sid) = req.station_id
            && sid != vehicle.station_id
        {
            return Err(EngineError::validation(format!(
                "vehicle {} does not belong to station {sid}",
                vehicle.id
            )));
        }
        if vehicle.maintenance {
            return Err(EngineError::UnderMaintenance(vehicle.id));
        }
        if !self.store.is_managed(&vehicle.station_id) {
            return Err(EngineError::StationUnmanaged(vehicle.station_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
        }
        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id: req.id,
            user_id: req.user_id,
            vehicle_id: guard.vehicle.id,
            station_id: guard.vehicle.station_id,
            span,
            original_end: span.end,
            created_at: now,
            updated_at: now,
            total_cost: cost_for(span.duration_ms(), guard.vehicle.price_per_hour),
            status: BookingStatus::PendingConfirmation,
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            payment_deadline: None,
            modifications: Vec::new(),
            emergency_contacts: req.emergency_contacts,
            cancel_reason: None,
            reminder_sent: false,
            version: 1,
        };
        // A concurrent create with the same id may have won the race to here.
        if !self.store.claim_booking_id(booking.id, booking.vehicle_id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        if let Err(e) = self.persist_booking(&mut guard, booking.clone()).await {
            self.store.release_booking_id(&booking.id);
            return Err(e);
        }
        let model = guard.vehicle.model_name.clone();
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking = %booking.id,
            vehicle = %booking.vehicle_id,
            user = %booking.user_id,
            start = booking.span.start,
            end = booking.span.end,
            cost = booking.total_cost,
            "booking created"
        );
        self.announce(&booking, transition_notice(&booking, &model)).await;
        Ok(booking)
    }

    /// Staff moving a booking through the table. `expected_version`, when
    /// given, must match the stored version.
    pub async fn update_booking_status(
        &self,
        id: Ulid,
        to: BookingStatus,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        self.transition(id, to, Trigger::Staff, expected_version).await
    }

    /// Super-admin emergency cancel. Only confirmed or active bookings.
    pub async fn admin_cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Cancelled, Trigger::AdminOverride, None)
            .await
    }

    pub async fn expire_unconfirmed(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Cancelled, Trigger::UnconfirmedTimeout, None)
            .await
    }

    pub async fn expire_unpaid(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Cancelled, Trigger::PaymentTimeout, None)
            .await
    }

    /// The only place booking status changes.
    pub async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        trigger: Trigger,
        expected_version: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if let Some(expected) = expected_version
            && expected != current.version
        {
            return Err(EngineError::StaleVersion {
                expected,
                found: current.version,
            });
        }
        let next = plan_transition(&current, to, trigger, now, &self.policy)?;

        let vehicle_before = project_status(&guard);
        self.persist_booking(&mut guard, next.clone()).await?;
        let vehicle_after = project_status(&guard);
        let model = guard.vehicle.model_name.clone();
        drop(guard);

        metrics::counter!(
            observability::BOOKING_TRANSITIONS_TOTAL,
            "from" => current.status.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        tracing::info!(
            booking = %id,
            from = %current.status,
            to = %to,
            ?trigger,
            vehicle = %next.vehicle_id,
            %vehicle_before,
            %vehicle_after,
            "booking transitioned"
        );
        self.announce(&next, transition_notice(&next, &model)).await;
        Ok(next)
    }

    /// Extend or shorten a booking. The start never moves.
    pub async fn modify_booking(
        &self,
        id: Ulid,
        new_end: Ms,
        kind: ModificationKind,
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !matches!(
            current.status,
            BookingStatus::PendingConfirmation | BookingStatus::Confirmed
        ) {
            return Err(EngineError::NotModifiable {
                id,
                status: current.status,
            });
        }

        let new_span = validate_span(current.span.start, new_end)?;
        match kind {
            ModificationKind::Extend if new_end <= current.span.end => {
                return Err(EngineError::validation(
                    "an extension must move the end time later",
                ));
            }
            ModificationKind::Shorten if new_end >= current.span.end => {
                return Err(EngineError::validation(
                    "shortening must move the end time earlier",
                ));
            }
            _ => {}
        }
        check_duration(&self.policy, &new_span)?;
        check_operating_hours(&self.policy, &new_span)?;
        if current.modifications.len() >= MAX_MODIFICATIONS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many modifications"));
        }
        check_no_conflict(&guard, &new_span, Some(id))?;

        let delta = cost_for(
            new_span.duration_ms() - current.span.duration_ms(),
            guard.vehicle.price_per_hour,
        );
        let mut next = current.clone();
        next.modifications.push(Modification {
            kind,
            old_end: current.span.end,
            new_end,
            additional_cost: delta,
            at: now,
        });
        next.span = new_span;
        next.total_cost += delta;
        next.updated_at = now;
        next.version += 1;

        self.persist_booking(&mut guard, next.clone()).await?;
        let model = guard.vehicle.model_name.clone();
        drop(guard);

        tracing::info!(
            booking = %id,
            kind = %kind,
            old_end = current.span.end,
            new_end,
            delta,
            "booking modified"
        );
        self.announce(&next, modification_notice(&current, &next, &model))
            .await;
        Ok(next)
    }

    /// Gateway callback. Completing twice is a no-op; anything after a
    /// completed payment is rejected.
    pub async fn record_payment(
        &self,
        id: Ulid,
        outcome: PaymentStatus,
        payment_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        if outcome == PaymentStatus::Pending {
            return Err(EngineError::validation(
                "payment result must be completed or failed",
            ));
        }
        if payment_id.as_ref().is_some_and(|p| p.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("payment id too long"));
        }

        let now = self.now();
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !matches!(
            current.status,
            BookingStatus::PendingConfirmation | BookingStatus::Confirmed
        ) {
            return Err(EngineError::NotModifiable {
                id,
                status: current.status,
            });
        }
        if current.payment_status == PaymentStatus::Completed {
            if outcome == PaymentStatus::Completed {
                return Ok(current);
            }
            return Err(EngineError::validation("payment already completed"));
        }
        if current.status == BookingStatus::Confirmed
            && let Some(deadline) = current.payment_deadline
            && deadline < now
        {
            return Err(EngineError::DeadlinePassed(deadline));
        }

        let mut next = current;
        next.payment_status = outcome;
        next.payment_id = payment_id;
        next.updated_at = now;
        next.version += 1;
        self.persist_booking(&mut guard, next.clone()).await?;
        let model = guard.vehicle.model_name.clone();
        drop(guard);

        tracing::info!(booking = %id, outcome = %outcome, "payment recorded");
        self.announce(&next, payment_notice(&next, &model)).await;
        Ok(next)
    }

    /// Mark a reminder as sent and deliver it. `Ok(None)` when no reminder
    /// is due (already sent, too early, or no longer live).
    pub async fn send_reminder(&self, id: Ulid) -> Result<Option<Booking>, EngineError> {
        let now = self.now();
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !reminder_due(&current, &self.policy, now) {
            return Ok(None);
        }
        let mut next = current;
        next.reminder_sent = true;
        next.updated_at = now;
        next.version += 1;
        self.persist_booking(&mut guard, next.clone()).await?;
        let model = guard.vehicle.model_name.clone();
        drop(guard);

        tracing::debug!(booking = %id, "reminder sent");
        self.remind(&next, &model).await;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const DAY0: Ms = 1_767_225_600_000;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            vehicle_id: Ulid::new(),
            station_id: Ulid::new(),
            span: Span::new(DAY0 + 10 * HOUR_MS, DAY0 + 12 * HOUR_MS),
            original_end: DAY0 + 12 * HOUR_MS,
            created_at: DAY0,
            updated_at: DAY0,
            total_cost: 4_000,
            status,
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            payment_deadline: None,
            modifications: vec![],
            emergency_contacts: vec![],
            cancel_reason: None,
            reminder_sent: false,
            version: 3,
        }
    }

    #[test]
    fn table_is_exactly_six_edges() {
        let all = [PendingConfirmation, Confirmed, Active, Completed, Cancelled];
        let edges = all
            .iter()
            .flat_map(|f| all.iter().map(move |t| (*f, *t)))
            .filter(|(f, t)| can_transition(*f, *t))
            .count();
        assert_eq!(edges, 6);
        for t in all {
            assert!(!can_transition(Completed, t));
            assert!(!can_transition(Cancelled, t));
        }
    }

    #[test]
    fn confirm_sets_payment_deadline_and_bumps_version() {
        let p = Policy::default();
        let next = plan_transition(&booking(PendingConfirmation), Confirmed, Trigger::Staff, DAY0 + 5, &p).unwrap();
        assert_eq!(next.status, Confirmed);
        assert_eq!(next.payment_deadline, Some(DAY0 + 5 + p.payment_window_ms));
        assert_eq!(next.version, 4);
        assert_eq!(next.updated_at, DAY0 + 5);
    }

    #[test]
    fn activation_requires_completed_payment() {
        let p = Policy::default();
        let b = booking(Confirmed);
        assert!(matches!(
            plan_transition(&b, Active, Trigger::Staff, DAY0, &p),
            Err(EngineError::PaymentRequired)
        ));
        let mut paid = b;
        paid.payment_status = PaymentStatus::Completed;
        assert!(plan_transition(&paid, Active, Trigger::Staff, DAY0, &p).is_ok());
    }

    #[test]
    fn illegal_pair_reports_both_ends() {
        let p = Policy::default();
        let err = plan_transition(&booking(Completed), Cancelled, Trigger::Staff, DAY0, &p).unwrap_err();
        assert_eq!(err.to_string(), "cannot move booking from completed to cancelled");
    }

    #[test]
    fn admin_override_only_cancels_confirmed_or_active() {
        let p = Policy::default();
        assert!(plan_transition(&booking(PendingConfirmation), Cancelled, Trigger::AdminOverride, DAY0, &p).is_err());
        let next = plan_transition(&booking(Active), Cancelled, Trigger::AdminOverride, DAY0, &p).unwrap();
        assert_eq!(next.cancel_reason, Some(CancelReason::AdminOverride));
    }

    #[test]
    fn unconfirmed_timeout_waits_for_ttl() {
        let p = Policy::default();
        let b = booking(PendingConfirmation);
        let at_ttl = DAY0 + p.unconfirmed_ttl_ms;
        assert!(matches!(
            plan_transition(&b, Cancelled, Trigger::UnconfirmedTimeout, at_ttl, &p),
            Err(EngineError::NotExpired(_))
        ));
        let next = plan_transition(&b, Cancelled, Trigger::UnconfirmedTimeout, at_ttl + 1, &p).unwrap();
        assert_eq!(next.cancel_reason, Some(CancelReason::Unconfirmed));
        assert_eq!(next.payment_status, PaymentStatus::Pending);
    }

    #[test]
    fn payment_timeout_marks_payment_failed() {
        let p = Policy::default();
        let mut b = booking(Confirmed);
        b.payment_deadline = Some(DAY0 + 100);
        assert!(plan_transition(&b, Cancelled, Trigger::PaymentTimeout, DAY0 + 100, &p).is_err());
        let next = plan_transition(&b, Cancelled, Trigger::PaymentTimeout, DAY0 + 101, &p).unwrap();
        assert_eq!(next.payment_status, PaymentStatus::Failed);
        assert_eq!(next.cancel_reason, Some(CancelReason::PaymentTimeout));

        b.payment_status = PaymentStatus::Completed;
        assert!(matches!(
            plan_transition(&b, Cancelled, Trigger::PaymentTimeout, DAY0 + 101, &p),
            Err(EngineError::NotExpired(_))
        ));
    }

    #[test]
    fn cost_rounds_and_keeps_sign() {
        assert_eq!(cost_for(2 * HOUR_MS, 1_500), 3_000);
        assert_eq!(cost_for(-HOUR_MS, 1_500), -1_500);
        assert_eq!(cost_for(90 * MINUTE_MS, 1_001), 1_502);
        assert_eq!(cost_for(0, 1_000), 0);
    }

    #[test]
    fn reminder_window() {
        let p = Policy::default();
        let b = booking(Confirmed);
        let start = b.span.start;
        assert!(!reminder_due(&b, &p, start - p.reminder_lead_ms - 1));
        assert!(reminder_due(&b, &p, start - p.reminder_lead_ms));
        assert!(!reminder_due(&b, &p, start));
        let mut sent = b;
        sent.reminder_sent = true;
        assert!(!reminder_due(&sent, &p, start - MINUTE_MS));
    }

    #[test]
    fn every_status_has_distinct_notice_title() {
        let titles: std::collections::HashSet<String> = [PendingConfirmation, Confirmed, Active, Completed, Cancelled]
            .into_iter()
            .map(|s| transition_notice(&booking(s), "Zoe").title)
            .collect();
        assert_eq!(titles.len(), 5);
    }
}
