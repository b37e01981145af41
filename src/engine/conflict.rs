use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build a span from raw bounds, rejecting empty/inverted or absurd ranges.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::validation("start time must be before end time"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// Booking B conflicts with `span` iff B is live and the half-open
/// intervals overlap. `exclude` skips one booking (modifications check
/// against everything but themselves).
pub fn find_conflict<'a>(
    vs: &'a VehicleState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    vs.overlapping(span)
        .find(|b| b.is_live() && Some(b.id) != exclude && b.span.overlaps(span))
}

pub fn has_conflict(vs: &VehicleState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(vs, span, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    vs: &VehicleState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(vs, span, exclude) {
        Some(b) => Err(EngineError::Conflict(b.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_duration(policy: &Policy, span: &Span) -> Result<(), EngineError> {
    let d = span.duration_ms();
    if d < policy.min_duration_ms {
        return Err(EngineError::validation(format!(
            "booking must last at least {} minutes",
            policy.min_duration_ms / MINUTE_MS
        )));
    }
    if d > policy.max_duration_ms {
        return Err(EngineError::validation(format!(
            "booking cannot exceed {} hours",
            policy.max_duration_ms / HOUR_MS
        )));
    }
    Ok(())
}

pub(crate) fn check_operating_hours(policy: &Policy, span: &Span) -> Result<(), EngineError> {
    if !policy.within_operating_hours(span.start) {
        return Err(EngineError::validation(format!(
            "pickup must be between {:02}:00 and {:02}:00",
            policy.open_hour, policy.close_hour
        )));
    }
    if !policy.within_operating_hours(span.end) {
        return Err(EngineError::validation(format!(
            "return must be between {:02}:00 and {:02}:00",
            policy.open_hour, policy.close_hour
        )));
    }
    Ok(())
}

/// Every time-based guard a new booking must pass, in the order users
/// most often trip them.
pub(crate) fn validate_request(policy: &Policy, span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < now + policy.lead_time_ms {
        return Err(EngineError::validation(format!(
            "bookings must start at least {} minutes from now",
            policy.lead_time_ms / MINUTE_MS
        )));
    }
    check_duration(policy, span)?;
    check_operating_hours(policy, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY0: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z
    const H: Ms = HOUR_MS;

    fn state_with(bookings: Vec<(Ms, Ms, BookingStatus)>) -> VehicleState {
        let mut vs = VehicleState::new(Vehicle {
            id: Ulid::new(),
            station_id: Ulid::new(),
            model_name: "Kona".into(),
            image_url: None,
            price_per_hour: 1_000,
            maintenance: false,
            created_at: 0,
        });
        for (start, end, status) in bookings {
            vs.put_booking(Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                vehicle_id: vs.vehicle.id,
                station_id: vs.vehicle.station_id,
                span: Span::new(start, end),
                original_end: end,
                created_at: 0,
                updated_at: 0,
                total_cost: 0,
                status,
                payment_status: PaymentStatus::Pending,
                payment_id: None,
                payment_deadline: None,
                modifications: vec![],
                emergency_contacts: vec![],
                cancel_reason: None,
                reminder_sent: false,
                version: 1,
            });
        }
        vs
    }

    #[test]
    fn overlapping_live_booking_conflicts() {
        let vs = state_with(vec![(DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Confirmed)]);
        assert!(has_conflict(&vs, &Span::new(DAY0 + 11 * H, DAY0 + 13 * H), None));
        assert!(has_conflict(&vs, &Span::new(DAY0 + 9 * H, DAY0 + 15 * H), None));
    }

    #[test]
    fn touching_endpoints_do_not_conflict() {
        let vs = state_with(vec![(DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::PendingConfirmation)]);
        assert!(!has_conflict(&vs, &Span::new(DAY0 + 12 * H, DAY0 + 14 * H), None));
        assert!(!has_conflict(&vs, &Span::new(DAY0 + 8 * H, DAY0 + 10 * H), None));
    }

    #[test]
    fn cancelled_and_completed_are_exempt() {
        let vs = state_with(vec![
            (DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Cancelled),
            (DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Completed),
        ]);
        assert!(!has_conflict(&vs, &Span::new(DAY0 + 10 * H, DAY0 + 12 * H), None));
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let vs = state_with(vec![(DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Confirmed)]);
        let own = vs.bookings[0].id;
        assert!(!has_conflict(&vs, &Span::new(DAY0 + 10 * H, DAY0 + 13 * H), Some(own)));
    }

    #[test]
    fn conflict_error_names_blocking_booking() {
        let vs = state_with(vec![(DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Active)]);
        let blocking = vs.bookings[0].id;
        let err = check_no_conflict(&vs, &Span::new(DAY0 + 11 * H, DAY0 + 12 * H), None).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(id) if id == blocking));
    }

    #[test]
    fn lead_time_enforced() {
        let p = Policy::default();
        let now = DAY0 + 8 * H;
        let too_soon = Span::new(now + 29 * MINUTE_MS, now + 2 * H);
        assert!(matches!(validate_request(&p, &too_soon, now), Err(EngineError::Validation(_))));
        let ok = Span::new(now + 30 * MINUTE_MS, now + 2 * H);
        assert!(validate_request(&p, &ok, now).is_ok());
    }

    #[test]
    fn duration_bounds_enforced() {
        let p = Policy::default();
        assert!(check_duration(&p, &Span::new(0, H - 1)).is_err());
        assert!(check_duration(&p, &Span::new(0, H)).is_ok());
        assert!(check_duration(&p, &Span::new(0, 168 * H)).is_ok());
        assert!(check_duration(&p, &Span::new(0, 168 * H + 1)).is_err());
    }

    #[test]
    fn operating_hours_apply_to_pickup_and_return() {
        let p = Policy::default();
        assert!(check_operating_hours(&p, &Span::new(DAY0 + 5 * H, DAY0 + 8 * H)).is_err());
        assert!(check_operating_hours(&p, &Span::new(DAY0 + 21 * H, DAY0 + 24 * H)).is_err());
        assert!(check_operating_hours(&p, &Span::new(DAY0 + 21 * H, DAY0 + 23 * H)).is_ok());
        // multi-day rental returned the next morning
        assert!(check_operating_hours(&p, &Span::new(DAY0 + 9 * H, DAY0 + 33 * H)).is_ok());
    }

    #[test]
    fn inverted_span_rejected() {
        assert!(matches!(
            validate_span(DAY0 + 2 * H, DAY0 + H),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(validate_span(0, 10), Err(EngineError::LimitExceeded(_))));
    }
}
