use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{PushKind, PushMessage, Room};

use super::availability::vehicle_info;
use super::{Engine, EngineError};

fn check_name(what: &'static str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation(format!("{what} cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_price(price_per_hour: Cents) -> Result<(), EngineError> {
    if price_per_hour <= 0 {
        return Err(EngineError::validation("price per hour must be positive"));
    }
    Ok(())
}

impl Engine {
    // ── Stations ─────────────────────────────────────────────

    pub async fn create_station(
        &self,
        id: Ulid,
        name: String,
        location: String,
    ) -> Result<Station, EngineError> {
        check_name("station name", &name)?;
        if location.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("location too long"));
        }
        if self.store.station(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        // Claim the name before the WAL write so two racing creates can't
        // both succeed; give it back if the write fails.
        if self.store.reserve_station_name(&name, id).is_err() {
            return Err(EngineError::NameTaken(name));
        }
        let station = Station {
            id,
            name: name.trim().to_string(),
            location,
            created_at: self.now(),
        };
        let event = Event::StationPut(station.clone());
        if let Err(e) = self.commit(&event, |store| store.put_station(station.clone())).await {
            self.store.release_station_name(&name, id);
            return Err(e);
        }
        tracing::info!(station = %id, name = %station.name, "station created");
        Ok(station)
    }

    /// Only empty stations with nobody assigned can go.
    pub async fn delete_station(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.station(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let mut has_vehicles = false;
        for shared in self.store.vehicle_handles() {
            if shared.read().await.vehicle.station_id == id {
                has_vehicles = true;
                break;
            }
        }
        if has_vehicles {
            return Err(EngineError::HasVehicles(id));
        }
        if !self.store.station_masters(&id).is_empty() {
            return Err(EngineError::validation(
                "station still has station-masters assigned",
            ));
        }
        self.commit(&Event::StationDeleted { id }, |store| store.remove_station(&id))
            .await?;
        tracing::info!(station = %id, "station deleted");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────

    fn check_role(&self, role: &Role) -> Result<(), EngineError> {
        if let Some(station_id) = role.station_id()
            && self.store.station(&station_id).is_none()
        {
            return Err(EngineError::NotFound(station_id));
        }
        Ok(())
    }

    pub async fn register_user(&self, id: Ulid, name: String, role: Role) -> Result<User, EngineError> {
        check_name("user name", &name)?;
        if self.store.user(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_role(&role)?;
        let user = User {
            id,
            name,
            role,
            active: true,
            created_at: self.now(),
        };
        self.commit(&Event::UserPut(user.clone()), |store| store.put_user(user.clone()))
            .await?;
        tracing::info!(user = %id, role = role.label(), "user registered");
        Ok(user)
    }

    /// Change a user's role. The user's sessions get a `role_changed` push so
    /// clients can refresh their capabilities.
    pub async fn change_role(&self, id: Ulid, role: Role) -> Result<User, EngineError> {
        let mut user = self.store.user(&id).ok_or(EngineError::NotFound(id))?;
        self.check_role(&role)?;
        if user.role == role {
            return Ok(user);
        }
        let old = user.role;
        user.role = role;
        self.commit(&Event::UserPut(user.clone()), |store| store.put_user(user.clone()))
            .await?;
        tracing::info!(user = %id, from = old.label(), to = role.label(), "role changed");

        let payload = json!({
            "role": role.label(),
            "station_id": role.station_id().map(|s| s.to_string()),
        });
        self.push_best_effort(Room::User(id), PushMessage::new(PushKind::RoleChanged, payload))
            .await;
        if let Err(e) = self
            .notify(
                id,
                "Role updated",
                format!("Your role is now {}.", role.label()),
                NotificationKind::Account,
                Priority::Normal,
                None,
            )
            .await
        {
            tracing::warn!(user = %id, error = %e, "role notification not stored");
        }
        for station_id in [old.station_id(), role.station_id()].into_iter().flatten() {
            self.refresh_dashboards(station_id).await;
        }
        Ok(user)
    }

    /// Deactivated users keep their history but can't book, and any open
    /// session is told to log out.
    pub async fn deactivate_user(&self, id: Ulid) -> Result<User, EngineError> {
        let mut user = self.store.user(&id).ok_or(EngineError::NotFound(id))?;
        if !user.active {
            return Ok(user);
        }
        user.active = false;
        self.commit(&Event::UserPut(user.clone()), |store| store.put_user(user.clone()))
            .await?;
        tracing::info!(user = %id, "user deactivated");
        self.push_best_effort(
            Room::User(id),
            PushMessage::new(PushKind::ForceLogout, json!({ "reason": "account deactivated" })),
        )
        .await;
        if let Some(station_id) = user.role.station_id() {
            self.refresh_dashboards(station_id).await;
        }
        Ok(user)
    }

    // ── Vehicles ─────────────────────────────────────────────

    pub async fn create_vehicle(
        &self,
        id: Ulid,
        station_id: Ulid,
        model_name: String,
        price_per_hour: Cents,
        image_url: Option<String>,
    ) -> Result<VehicleInfo, EngineError> {
        check_name("model name", &model_name)?;
        check_price(price_per_hour)?;
        if image_url.as_ref().is_some_and(|u| u.len() > MAX_URL_LEN) {
            return Err(EngineError::LimitExceeded("image url too long"));
        }
        if self.store.vehicle_count() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.store.station(&station_id).is_none() {
            return Err(EngineError::NotFound(station_id));
        }
        if self.store.contains_vehicle(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let vehicle = Vehicle {
            id,
            station_id,
            model_name,
            image_url,
            price_per_hour,
            maintenance: false,
            created_at: self.now(),
        };
        let event = Event::VehiclePut(vehicle.clone());
        let guard = self
            .store
            .try_insert_vehicle(vehicle)
            .ok_or(EngineError::AlreadyExists(id))?;
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_vehicle(&id);
            return Err(e);
        }
        let info = vehicle_info(&guard);
        drop(guard);
        tracing::info!(vehicle = %id, station = %station_id, "vehicle created");
        self.refresh_dashboards(station_id).await;
        Ok(info)
    }

    /// Price changes apply to new bookings and future modifications only.
    pub async fn update_vehicle_price(
        &self,
        id: Ulid,
        price_per_hour: Cents,
    ) -> Result<VehicleInfo, EngineError> {
        check_price(price_per_hour)?;
        let mut guard = self.vehicle_write(&id).await?;
        let mut vehicle = guard.vehicle.clone();
        vehicle.price_per_hour = price_per_hour;
        self.persist_vehicle(&mut guard, vehicle).await?;
        Ok(vehicle_info(&guard))
    }

    /// Manual maintenance hold. Existing bookings are left alone; the
    /// vehicle just stops accepting new ones.
    pub async fn set_maintenance(&self, id: Ulid, on: bool) -> Result<VehicleInfo, EngineError> {
        let mut guard = self.vehicle_write(&id).await?;
        if guard.vehicle.maintenance != on {
            let mut vehicle = guard.vehicle.clone();
            vehicle.maintenance = on;
            self.persist_vehicle(&mut guard, vehicle).await?;
            tracing::info!(vehicle = %id, maintenance = on, "maintenance hold changed");
        }
        let info = vehicle_info(&guard);
        drop(guard);
        self.refresh_dashboards(info.station_id).await;
        Ok(info)
    }

    pub async fn delete_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.vehicle_write(&id).await?;
        if guard.live_bookings().next().is_some() {
            return Err(EngineError::HasLiveBookings(id));
        }
        self.wal_append(&Event::VehicleDeleted { id }).await?;
        self.store.retire_vehicle(&guard);
        let station_id = guard.vehicle.station_id;
        drop(guard);
        tracing::info!(vehicle = %id, "vehicle deleted");
        self.refresh_dashboards(station_id).await;
        Ok(())
    }

    /// Remove every idle vehicle from a station nobody manages. Vehicles
    /// still holding live bookings are left in place.
    pub async fn remove_unmanaged_vehicles(&self, station_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        if self.store.station(&station_id).is_none() {
            return Err(EngineError::NotFound(station_id));
        }
        if self.store.is_managed(&station_id) {
            return Err(EngineError::validation(format!(
                "station {station_id} has an active station-master"
            )));
        }
        let mut candidates = Vec::new();
        for shared in self.store.vehicle_handles() {
            let guard = shared.read().await;
            if guard.vehicle.station_id == station_id {
                candidates.push(guard.vehicle.id);
            }
        }

        let mut removed = Vec::new();
        for id in candidates {
            match self.delete_vehicle(id).await {
                Ok(()) => removed.push(id),
                Err(EngineError::HasLiveBookings(_)) | Err(EngineError::NotFound(_)) => {
                    tracing::debug!(vehicle = %id, "unmanaged cleanup skipped busy vehicle");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(station = %station_id, removed = removed.len(), "unmanaged fleet cleaned up");
        Ok(removed)
    }
}
