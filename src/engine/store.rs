use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::SharedVehicleState;

/// The document collections. Vehicles carry their bookings under one lock;
/// everything else is a flat map.
pub struct InMemoryStore {
    stations: DashMap<Ulid, Station>,
    /// Lower-cased station name → station id.
    station_names: DashMap<String, Ulid>,
    users: DashMap<Ulid, User>,
    vehicles: DashMap<Ulid, SharedVehicleState>,
    /// booking id → vehicle id, for bookings on live vehicles.
    booking_to_vehicle: DashMap<Ulid, Ulid>,
    /// Bookings whose vehicle has been deleted. Kept for history.
    retired: DashMap<Ulid, Booking>,
    /// user id → notifications, oldest first.
    notifications: DashMap<Ulid, Vec<NotificationRecord>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            stations: DashMap::new(),
            station_names: DashMap::new(),
            users: DashMap::new(),
            vehicles: DashMap::new(),
            booking_to_vehicle: DashMap::new(),
            retired: DashMap::new(),
            notifications: DashMap::new(),
        }
    }

    // ── Stations ─────────────────────────────────────────────

    pub fn station(&self, id: &Ulid) -> Option<Station> {
        self.stations.get(id).map(|e| e.value().clone())
    }

    pub fn stations(&self) -> Vec<Station> {
        let mut all: Vec<Station> = self.stations.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Claim a station name. Returns the current owner if already taken.
    pub fn reserve_station_name(&self, name: &str, id: Ulid) -> Result<(), Ulid> {
        match self.station_names.entry(name_key(name)) {
            Entry::Occupied(e) if *e.get() != id => Err(*e.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    pub fn release_station_name(&self, name: &str, id: Ulid) {
        self.station_names.remove_if(&name_key(name), |_, owner| *owner == id);
    }

    pub fn put_station(&self, station: Station) {
        if let Some(old) = self.stations.get(&station.id).map(|e| e.name.clone())
            && name_key(&old) != name_key(&station.name)
        {
            self.release_station_name(&old, station.id);
        }
        self.station_names.insert(name_key(&station.name), station.id);
        self.stations.insert(station.id, station);
    }

    pub fn remove_station(&self, id: &Ulid) -> Option<Station> {
        let (_, station) = self.stations.remove(id)?;
        self.release_station_name(&station.name, *id);
        Some(station)
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    pub fn put_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Active station-masters assigned to a station.
    pub fn station_masters(&self, station_id: &Ulid) -> Vec<Ulid> {
        self.users
            .iter()
            .filter(|e| e.active && e.role.station_id() == Some(*station_id))
            .map(|e| e.id)
            .collect()
    }

    pub fn is_managed(&self, station_id: &Ulid) -> bool {
        self.users
            .iter()
            .any(|e| e.active && e.role.station_id() == Some(*station_id))
    }

    // ── Vehicles ─────────────────────────────────────────────

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// True if `shared` is still the live handle for `id`. A handle can go
    /// stale while a caller waits for its lock.
    pub fn is_current_vehicle(&self, id: &Ulid, shared: &SharedVehicleState) -> bool {
        self.vehicles
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    pub fn contains_vehicle(&self, id: &Ulid) -> bool {
        self.vehicles.contains_key(id)
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    /// Insert a vehicle only if its id is free. The returned guard is held
    /// by the caller until the vehicle is durable.
    pub fn try_insert_vehicle(
        &self,
        vehicle: Vehicle,
    ) -> Option<OwnedRwLockWriteGuard<VehicleState>> {
        match self.vehicles.entry(vehicle.id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(e) => {
                let shared = Arc::new(RwLock::new(VehicleState::new(vehicle)));
                let guard = shared.clone().try_write_owned().ok()?;
                e.insert(shared);
                Some(guard)
            }
        }
    }

    pub fn remove_vehicle(&self, id: &Ulid) {
        self.vehicles.remove(id);
    }

    pub fn insert_vehicle(&self, vehicle: Vehicle) -> SharedVehicleState {
        let id = vehicle.id;
        let shared = Arc::new(RwLock::new(VehicleState::new(vehicle)));
        self.vehicles.insert(id, shared.clone());
        shared
    }

    /// Snapshot of every vehicle handle. Never hold DashMap refs across an await.
    pub fn vehicle_handles(&self) -> Vec<SharedVehicleState> {
        self.vehicles.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop a vehicle; its bookings move to the retired set.
    pub fn retire_vehicle(&self, vs: &VehicleState) {
        for b in &vs.bookings {
            self.booking_to_vehicle.remove(&b.id);
            self.retired.insert(b.id, b.clone());
        }
        self.vehicles.remove(&vs.vehicle.id);
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn vehicle_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_vehicle.get(booking_id).map(|e| *e.value())
    }

    pub fn contains_booking(&self, id: &Ulid) -> bool {
        self.booking_to_vehicle.contains_key(id) || self.retired.contains_key(id)
    }

    /// Claim a booking id for a vehicle. False if the id is taken, live
    /// or retired.
    pub fn claim_booking_id(&self, booking_id: Ulid, vehicle_id: Ulid) -> bool {
        if self.retired.contains_key(&booking_id) {
            return false;
        }
        match self.booking_to_vehicle.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(vehicle_id);
                true
            }
        }
    }

    pub fn release_booking_id(&self, booking_id: &Ulid) {
        self.booking_to_vehicle.remove(booking_id);
    }

    pub fn put_booking(&self, vs: &mut VehicleState, booking: Booking) {
        self.booking_to_vehicle.insert(booking.id, vs.vehicle.id);
        vs.put_booking(booking);
    }

    pub fn retired_booking(&self, id: &Ulid) -> Option<Booking> {
        self.retired.get(id).map(|e| e.value().clone())
    }

    pub fn retired_bookings(&self) -> Vec<Booking> {
        self.retired.iter().map(|e| e.value().clone()).collect()
    }

    pub fn put_retired(&self, booking: Booking) {
        self.retired.insert(booking.id, booking);
    }

    // ── Notifications ────────────────────────────────────────

    pub fn put_notification(&self, record: NotificationRecord) {
        let mut list = self.notifications.entry(record.user_id).or_default();
        match list.iter().position(|n| n.id == record.id) {
            Some(pos) => list[pos] = record,
            None => {
                let pos = list.partition_point(|n| n.created_at <= record.created_at);
                list.insert(pos, record);
            }
        }
    }

    pub fn notifications_for(&self, user_id: &Ulid) -> Vec<NotificationRecord> {
        self.notifications
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn notification(&self, user_id: &Ulid, id: &Ulid) -> Option<NotificationRecord> {
        self.notifications
            .get(user_id)
            .and_then(|list| list.iter().find(|n| &n.id == id).cloned())
    }

    pub fn all_notifications(&self) -> Vec<NotificationRecord> {
        self.notifications
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    /// Drop records whose expiry is at or before `before`. Returns how many went.
    pub fn purge_notifications(&self, before: Ms) -> usize {
        let mut removed = 0;
        for mut entry in self.notifications.iter_mut() {
            let len = entry.len();
            entry.retain(|n| n.expires_at > before);
            removed += len - entry.len();
        }
        self.notifications.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn count_expired_notifications(&self, before: Ms) -> usize {
        self.notifications
            .iter()
            .map(|e| e.iter().filter(|n| n.expires_at <= before).count())
            .sum()
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply one logged event. Runs before the engine is shared, so every
    /// lock is uncontended.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::StationPut(station) => self.put_station(station.clone()),
            Event::StationDeleted { id } => {
                self.remove_station(id);
            }
            Event::UserPut(user) => self.put_user(user.clone()),
            Event::VehiclePut(vehicle) => match self.get_vehicle(&vehicle.id) {
                Some(shared) => {
                    if let Ok(mut guard) = shared.try_write() {
                        guard.vehicle = vehicle.clone();
                    }
                }
                None => {
                    self.insert_vehicle(vehicle.clone());
                }
            },
            Event::VehicleDeleted { id } => {
                if let Some(shared) = self.get_vehicle(id)
                    && let Ok(guard) = shared.try_read()
                {
                    self.retire_vehicle(&guard);
                }
            }
            Event::BookingPut(booking) => match self.get_vehicle(&booking.vehicle_id) {
                Some(shared) => {
                    if let Ok(mut guard) = shared.try_write() {
                        self.put_booking(&mut guard, booking.clone());
                    }
                }
                None => self.put_retired(booking.clone()),
            },
            Event::NotificationPut(record) => self.put_notification(record.clone()),
            Event::NotificationsPurged { before } => {
                self.purge_notifications(*before);
            }
        }
    }
}
