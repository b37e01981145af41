use crate::limits::Policy;
use crate::limits::DAY_MS;
use crate::model::*;

// ── Status projection ────────────────────────────────────────────

/// Vehicle status is derived from the vehicle document and its bookings,
/// never stored. Maintenance wins, then an active ride, then any
/// reservation still waiting to start.
pub fn project_status(vs: &VehicleState) -> VehicleStatus {
    if vs.vehicle.maintenance {
        return VehicleStatus::Maintenance;
    }
    let mut reserved = false;
    for b in vs.live_bookings() {
        match b.status {
            BookingStatus::Active => return VehicleStatus::InUse,
            BookingStatus::PendingConfirmation | BookingStatus::Confirmed => reserved = true,
            _ => {}
        }
    }
    if reserved {
        VehicleStatus::Reserved
    } else {
        VehicleStatus::Available
    }
}

/// Latest end among live bookings: the earliest instant after which the
/// vehicle is guaranteed free of current commitments.
pub fn available_after(vs: &VehicleState) -> Option<Ms> {
    vs.live_bookings().map(|b| b.span.end).max()
}

pub fn vehicle_info(vs: &VehicleState) -> VehicleInfo {
    let v = &vs.vehicle;
    VehicleInfo {
        id: v.id,
        station_id: v.station_id,
        model_name: v.model_name.clone(),
        image_url: v.image_url.clone(),
        price_per_hour: v.price_per_hour,
        status: project_status(vs),
        available_after: available_after(vs),
    }
}

pub fn booked_slots(vs: &VehicleState, window: Option<&Span>) -> Vec<BookedSlot> {
    let to_slot = |b: &Booking| BookedSlot {
        booking_id: b.id,
        start: b.span.start,
        end: b.span.end,
        status: b.status,
    };
    match window {
        Some(w) => vs.overlapping(w).filter(|b| b.is_live()).map(to_slot).collect(),
        None => vs.live_bookings().map(to_slot).collect(),
    }
}

// ── Free windows ─────────────────────────────────────────────────

/// Daily opening windows intersected with the query.
pub fn operating_windows(policy: &Policy, query: &Span) -> Vec<Span> {
    let mut windows = Vec::new();
    let mut day = policy.day_start(query.start);
    while day < query.end {
        let open = (day + policy.opens_at_ms()).max(query.start);
        let close = (day + policy.closes_at_ms()).min(query.end);
        if open < close {
            windows.push(Span::new(open, close));
        }
        day += DAY_MS;
    }
    merge_overlapping(&windows)
}

/// Free, bookable intervals for a vehicle inside `query`: opening hours
/// minus every live booking. Maintenance vehicles have none.
pub fn free_windows(vs: &VehicleState, policy: &Policy, query: &Span) -> Vec<Span> {
    if vs.vehicle.maintenance {
        return Vec::new();
    }
    let open = operating_windows(policy, query);
    let mut taken: Vec<Span> = vs
        .overlapping(query)
        .filter(|b| b.is_live())
        .map(|b| b.span)
        .collect();
    if taken.is_empty() {
        return open;
    }
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&open, &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::HOUR_MS;
    use ulid::Ulid;

    const DAY0: Ms = 1_767_225_600_000;
    const H: Ms = HOUR_MS;

    fn s(start: Ms, end: Ms) -> Span {
        Span::new(start, end)
    }

    fn vehicle_state(maintenance: bool) -> VehicleState {
        VehicleState::new(Vehicle {
            id: Ulid::new(),
            station_id: Ulid::new(),
            model_name: "Ioniq 5".into(),
            image_url: None,
            price_per_hour: 2_000,
            maintenance,
            created_at: 0,
        })
    }

    fn add(vs: &mut VehicleState, start: Ms, end: Ms, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        vs.put_booking(Booking {
            id,
            user_id: Ulid::new(),
            vehicle_id: vs.vehicle.id,
            station_id: vs.vehicle.station_id,
            span: s(start, end),
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
        id
    }

    #[test]
    fn idle_vehicle_is_available() {
        let vs = vehicle_state(false);
        assert_eq!(project_status(&vs), VehicleStatus::Available);
        assert_eq!(available_after(&vs), None);
    }

    #[test]
    fn reservation_makes_vehicle_reserved() {
        let mut vs = vehicle_state(false);
        add(&mut vs, DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::PendingConfirmation);
        add(&mut vs, DAY0 + 14 * H, DAY0 + 16 * H, BookingStatus::Confirmed);
        assert_eq!(project_status(&vs), VehicleStatus::Reserved);
        assert_eq!(available_after(&vs), Some(DAY0 + 16 * H));
    }

    #[test]
    fn active_ride_wins_over_reservations() {
        let mut vs = vehicle_state(false);
        add(&mut vs, DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Active);
        add(&mut vs, DAY0 + 14 * H, DAY0 + 16 * H, BookingStatus::Confirmed);
        assert_eq!(project_status(&vs), VehicleStatus::InUse);
    }

    #[test]
    fn maintenance_wins_over_everything() {
        let mut vs = vehicle_state(true);
        add(&mut vs, DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Active);
        assert_eq!(project_status(&vs), VehicleStatus::Maintenance);
    }

    #[test]
    fn terminal_bookings_are_ignored() {
        let mut vs = vehicle_state(false);
        add(&mut vs, DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Completed);
        add(&mut vs, DAY0 + 14 * H, DAY0 + 16 * H, BookingStatus::Cancelled);
        assert_eq!(project_status(&vs), VehicleStatus::Available);
        assert_eq!(available_after(&vs), None);
        assert!(booked_slots(&vs, None).is_empty());
    }

    #[test]
    fn booked_slots_respect_window() {
        let mut vs = vehicle_state(false);
        add(&mut vs, DAY0 + 8 * H, DAY0 + 9 * H, BookingStatus::Confirmed);
        let later = add(&mut vs, DAY0 + 30 * H, DAY0 + 32 * H, BookingStatus::Confirmed);
        let slots = booked_slots(&vs, Some(&s(DAY0 + 24 * H, DAY0 + 48 * H)));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].booking_id, later);
    }

    #[test]
    fn operating_windows_span_days() {
        let p = Policy::default();
        let w = operating_windows(&p, &s(DAY0, DAY0 + 2 * DAY_MS));
        assert_eq!(
            w,
            vec![
                s(DAY0 + 6 * H, DAY0 + 23 * H),
                s(DAY0 + DAY_MS + 6 * H, DAY0 + DAY_MS + 23 * H),
            ]
        );
    }

    #[test]
    fn round_the_clock_windows_merge() {
        let p = Policy {
            open_hour: 0,
            close_hour: 24,
            ..Policy::default()
        };
        assert_eq!(
            operating_windows(&p, &s(DAY0 + H, DAY0 + 3 * DAY_MS)),
            vec![s(DAY0 + H, DAY0 + 3 * DAY_MS)]
        );
    }

    #[test]
    fn free_windows_punch_out_live_bookings() {
        let p = Policy::default();
        let mut vs = vehicle_state(false);
        add(&mut vs, DAY0 + 10 * H, DAY0 + 12 * H, BookingStatus::Confirmed);
        add(&mut vs, DAY0 + 12 * H, DAY0 + 13 * H, BookingStatus::PendingConfirmation);
        add(&mut vs, DAY0 + 15 * H, DAY0 + 16 * H, BookingStatus::Cancelled);
        let free = free_windows(&vs, &p, &s(DAY0, DAY0 + DAY_MS));
        assert_eq!(free, vec![s(DAY0 + 6 * H, DAY0 + 10 * H), s(DAY0 + 13 * H, DAY0 + 23 * H)]);
    }

    #[test]
    fn maintenance_vehicle_has_no_free_windows() {
        let p = Policy::default();
        let vs = vehicle_state(true);
        assert!(free_windows(&vs, &p, &s(DAY0, DAY0 + DAY_MS)).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![s(0, 100)];
        let remove = vec![s(30, 60)];
        assert_eq!(subtract_intervals(&base, &remove), vec![s(0, 30), s(60, 100)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![s(0, 100)];
        let remove = vec![s(10, 20), s(40, 50), s(80, 90)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![s(0, 10), s(20, 40), s(50, 80), s(90, 100)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![s(0, 10), s(10, 20), s(25, 30)];
        assert_eq!(merge_overlapping(&spans), vec![s(0, 20), s(25, 30)]);
    }
}
