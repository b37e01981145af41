use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{self, vehicle_info};
use super::conflict::{has_conflict, validate_span};
use super::lifecycle::{payment_expired, reminder_due, unconfirmed_expired};
use super::{Engine, EngineError};

/// Booking search. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub station_id: Option<Ulid>,
    pub vehicle_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.id.is_none_or(|id| b.id == id)
            && self.user_id.is_none_or(|u| b.user_id == u)
            && self.station_id.is_none_or(|s| b.station_id == s)
            && self.vehicle_id.is_none_or(|v| b.vehicle_id == v)
            && self.status.is_none_or(|s| b.status == s)
    }
}

fn check_window(span: &Span) -> Result<(), EngineError> {
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        match self.store.vehicle_for_booking(&id) {
            Some(vehicle_id) => {
                let shared = self.store.get_vehicle(&vehicle_id)?;
                let guard = shared.read().await;
                guard.booking(&id).cloned()
            }
            None => self.store.retired_booking(&id),
        }
    }

    /// Matching bookings, newest first.
    pub async fn find_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        if let Some(id) = filter.id {
            return self
                .get_booking(id)
                .await
                .filter(|b| filter.matches(b))
                .into_iter()
                .collect();
        }
        let mut out = Vec::new();
        let handles = match filter.vehicle_id {
            Some(vid) => self.store.get_vehicle(&vid).into_iter().collect(),
            None => self.store.vehicle_handles(),
        };
        for shared in handles {
            let guard = shared.read().await;
            if filter.station_id.is_some_and(|s| guard.vehicle.station_id != s) {
                continue;
            }
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.extend(
            self.store
                .retired_bookings()
                .into_iter()
                .filter(|b| filter.matches(b)),
        );
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn list_user_bookings(&self, user_id: Ulid) -> Vec<Booking> {
        self.find_bookings(&BookingFilter {
            user_id: Some(user_id),
            ..BookingFilter::default()
        })
        .await
    }

    /// The station's confirmation queue, oldest request first.
    pub async fn pending_for_station(&self, station_id: Ulid) -> Vec<Booking> {
        let mut pending = self
            .find_bookings(&BookingFilter {
                station_id: Some(station_id),
                status: Some(BookingStatus::PendingConfirmation),
                ..BookingFilter::default()
            })
            .await;
        pending.reverse();
        pending
    }

    /// All rides in progress across every station, soonest due first.
    pub async fn active_rides(&self) -> Vec<Booking> {
        let mut rides = self
            .find_bookings(&BookingFilter {
                status: Some(BookingStatus::Active),
                ..BookingFilter::default()
            })
            .await;
        rides.sort_by_key(|b| b.span.end);
        rides
    }

    /// Calendar view: live bookings on a vehicle, optionally within a window.
    pub async fn booked_slots(
        &self,
        vehicle_id: Ulid,
        window: Option<(Ms, Ms)>,
    ) -> Result<Vec<BookedSlot>, EngineError> {
        let window = match window {
            Some((start, end)) => {
                let span = validate_span(start, end)?;
                check_window(&span)?;
                Some(span)
            }
            None => None,
        };
        let shared = self
            .store
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = shared.read().await;
        Ok(availability::booked_slots(&guard, window.as_ref()))
    }

    pub async fn free_windows(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_span(start, end)?;
        check_window(&query)?;
        let shared = self
            .store
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = shared.read().await;
        let mut free = availability::free_windows(&guard, &self.policy, &query);
        if let Some(min) = min_duration_ms {
            free.retain(|s| s.duration_ms() >= min);
        }
        Ok(free)
    }

    pub async fn get_vehicle(&self, id: Ulid) -> Option<VehicleInfo> {
        let shared = self.store.get_vehicle(&id)?;
        let guard = shared.read().await;
        Some(vehicle_info(&guard))
    }

    /// Vehicles with their projected status. With a window, only vehicles
    /// that could take a booking for the whole window are returned.
    pub async fn search_vehicles(
        &self,
        station_id: Option<Ulid>,
        window: Option<(Ms, Ms)>,
    ) -> Result<Vec<VehicleInfo>, EngineError> {
        let window = match window {
            Some((start, end)) => {
                let span = validate_span(start, end)?;
                check_window(&span)?;
                Some(span)
            }
            None => None,
        };
        let mut out = Vec::new();
        for shared in self.store.vehicle_handles() {
            let guard = shared.read().await;
            if station_id.is_some_and(|s| guard.vehicle.station_id != s) {
                continue;
            }
            if let Some(w) = &window
                && (guard.vehicle.maintenance || has_conflict(&guard, w, None))
            {
                continue;
            }
            out.push(vehicle_info(&guard));
        }
        out.sort_by(|a, b| a.model_name.cmp(&b.model_name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Staff dashboard aggregate for one station.
    pub async fn dashboard(&self, station_id: Ulid) -> Result<DashboardInfo, EngineError> {
        if self.store.station(&station_id).is_none() {
            return Err(EngineError::NotFound(station_id));
        }
        let now = self.now();
        let mut info = DashboardInfo {
            station_id,
            total_vehicles: 0,
            available: 0,
            reserved: 0,
            in_use: 0,
            maintenance: 0,
            pending: 0,
            confirmed: 0,
            active: 0,
            overdue: Vec::new(),
        };
        for shared in self.store.vehicle_handles() {
            let guard = shared.read().await;
            if guard.vehicle.station_id != station_id {
                continue;
            }
            info.total_vehicles += 1;
            match availability::project_status(&guard) {
                VehicleStatus::Available => info.available += 1,
                VehicleStatus::Reserved => info.reserved += 1,
                VehicleStatus::InUse => info.in_use += 1,
                VehicleStatus::Maintenance => info.maintenance += 1,
            }
            for b in guard.live_bookings() {
                match b.status {
                    BookingStatus::PendingConfirmation => info.pending += 1,
                    BookingStatus::Confirmed => info.confirmed += 1,
                    BookingStatus::Active => {
                        info.active += 1;
                        if b.is_overdue(now) {
                            info.overdue.push(b.id);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(info)
    }

    pub fn list_stations(&self) -> Vec<Station> {
        self.store.stations()
    }

    pub fn get_user(&self, id: Ulid) -> Option<User> {
        self.store.user(&id)
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users = self.store.users();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        users
    }

    // ── Sweeper scans ────────────────────────────────────────

    async fn scan_live(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for shared in self.store.vehicle_handles() {
            let guard = shared.read().await;
            ids.extend(guard.live_bookings().filter(|b| pred(*b)).map(|b| b.id));
        }
        ids
    }

    /// Pending-confirmation bookings older than the confirmation window.
    pub async fn collect_unconfirmed_expired(&self, now: Ms) -> Vec<Ulid> {
        self.scan_live(|b| unconfirmed_expired(b, &self.policy, now)).await
    }

    /// Confirmed bookings whose payment deadline passed without payment.
    pub async fn collect_payment_expired(&self, now: Ms) -> Vec<Ulid> {
        self.scan_live(|b| payment_expired(b, now)).await
    }

    pub async fn collect_due_reminders(&self, now: Ms) -> Vec<Ulid> {
        self.scan_live(|b| reminder_due(b, &self.policy, now)).await
    }
}
