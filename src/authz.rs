//! Capability checks for wire commands. The engine trusts its callers;
//! everything a connected user may or may not touch is decided here.

use ulid::Ulid;

use crate::engine::{BookingFilter, Engine};
use crate::model::*;
use crate::notify::Room;

/// Who is issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The configured operator account. Acts as super-admin.
    Operator,
    User(User),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user {0} is deactivated")]
    Deactivated(Ulid),
    #[error("permission denied: {0}")]
    Forbidden(String),
}

impl AuthzError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            AuthzError::UnknownUser(_) | AuthzError::Deactivated(_) => "28000",
            AuthzError::Forbidden(_) => "42501",
        }
    }
}

fn forbidden(what: impl Into<String>) -> AuthzError {
    AuthzError::Forbidden(what.into())
}

/// Map a login name to an actor: the operator name, or a registered user's id.
pub fn resolve_actor(engine: &Engine, login: &str, operator: &str) -> Result<Actor, AuthzError> {
    if login == operator {
        return Ok(Actor::Operator);
    }
    let id = Ulid::from_string(login).map_err(|_| AuthzError::UnknownUser(login.to_string()))?;
    let user = engine
        .get_user(id)
        .ok_or_else(|| AuthzError::UnknownUser(login.to_string()))?;
    if !user.active {
        return Err(AuthzError::Deactivated(id));
    }
    Ok(Actor::User(user))
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        match self {
            Actor::Operator => true,
            Actor::User(u) => u.role == Role::SuperAdmin,
        }
    }

    pub fn user_id(&self) -> Option<Ulid> {
        match self {
            Actor::Operator => None,
            Actor::User(u) => Some(u.id),
        }
    }

    /// Station-master of `station_id`, or an admin.
    pub fn is_staff_of(&self, station_id: Ulid) -> bool {
        match self {
            Actor::User(u) if u.role.station_id() == Some(station_id) => true,
            _ => self.is_admin(),
        }
    }

    pub fn require_admin(&self) -> Result<(), AuthzError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(forbidden("super-admin only"))
        }
    }

    pub fn require_staff_of(&self, station_id: Ulid) -> Result<(), AuthzError> {
        if self.is_staff_of(station_id) {
            Ok(())
        } else {
            Err(forbidden(format!("not staff of station {station_id}")))
        }
    }

    /// Resolve the user a self-service command acts for. Only admins may
    /// name somebody else; the operator must always name someone.
    pub fn subject(&self, requested: Option<Ulid>) -> Result<Ulid, AuthzError> {
        match (self.user_id(), requested) {
            (Some(me), None) => Ok(me),
            (Some(me), Some(other)) if me == other => Ok(me),
            (_, Some(other)) if self.is_admin() => Ok(other),
            (None, None) => Err(forbidden("user_id is required for the operator account")),
            (_, Some(_)) => Err(forbidden("cannot act for another user")),
        }
    }

    /// Owner, staff of the booking's station, or admin.
    pub fn require_booking_access(&self, booking: &Booking) -> Result<(), AuthzError> {
        if self.user_id() == Some(booking.user_id) || self.is_staff_of(booking.station_id) {
            Ok(())
        } else {
            Err(forbidden(format!("no access to booking {}", booking.id)))
        }
    }

    /// Narrow a booking search to what this actor may see. Customers see
    /// their own bookings, station-masters their station's.
    pub fn scope_bookings(&self, mut filter: BookingFilter) -> Result<BookingFilter, AuthzError> {
        if self.is_admin() {
            return Ok(filter);
        }
        let Actor::User(user) = self else {
            return Ok(filter);
        };
        match user.role.station_id() {
            Some(station_id) if filter.user_id != Some(user.id) => {
                if filter.station_id.is_some_and(|s| s != station_id) {
                    return Err(forbidden(format!("not staff of station {station_id}")));
                }
                filter.station_id = Some(station_id);
            }
            _ => {
                if filter.user_id.is_some_and(|u| u != user.id) {
                    return Err(forbidden("cannot list another user's bookings"));
                }
                filter.user_id = Some(user.id);
            }
        }
        Ok(filter)
    }

    pub fn may_listen(&self, room: Room) -> Result<(), AuthzError> {
        let ok = match room {
            Room::Admin => self.is_admin(),
            Room::Station(s) => self.is_staff_of(s),
            Room::User(u) => self.user_id() == Some(u) || self.is_admin(),
        };
        if ok {
            Ok(())
        } else {
            Err(forbidden(format!("cannot listen on {room}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> Actor {
        Actor::User(User {
            id: Ulid::new(),
            name: "u".into(),
            role,
            active: true,
            created_at: 0,
        })
    }

    #[test]
    fn station_master_is_staff_of_own_station_only() {
        let s = Ulid::new();
        let master = user(Role::StationMaster { station_id: s });
        assert!(master.require_staff_of(s).is_ok());
        assert!(master.require_staff_of(Ulid::new()).is_err());
        assert!(master.require_admin().is_err());
        assert!(Actor::Operator.require_staff_of(s).is_ok());
        assert!(user(Role::SuperAdmin).require_admin().is_ok());
    }

    #[test]
    fn subject_defaults_to_self() {
        let c = user(Role::Customer);
        let me = c.user_id().unwrap();
        assert_eq!(c.subject(None).unwrap(), me);
        assert!(c.subject(Some(Ulid::new())).is_err());
        let other = Ulid::new();
        assert_eq!(Actor::Operator.subject(Some(other)).unwrap(), other);
        assert!(Actor::Operator.subject(None).is_err());
    }

    #[test]
    fn customers_are_scoped_to_their_bookings() {
        let c = user(Role::Customer);
        let scoped = c.scope_bookings(BookingFilter::default()).unwrap();
        assert_eq!(scoped.user_id, c.user_id());
        let snooping = BookingFilter {
            user_id: Some(Ulid::new()),
            ..BookingFilter::default()
        };
        assert!(matches!(
            c.scope_bookings(snooping),
            Err(AuthzError::Forbidden(_))
        ));
    }

    #[test]
    fn masters_are_scoped_to_their_station() {
        let s = Ulid::new();
        let m = user(Role::StationMaster { station_id: s });
        let scoped = m.scope_bookings(BookingFilter::default()).unwrap();
        assert_eq!(scoped.station_id, Some(s));
        assert_eq!(scoped.user_id, None);
        let elsewhere = BookingFilter {
            station_id: Some(Ulid::new()),
            ..BookingFilter::default()
        };
        assert!(m.scope_bookings(elsewhere).is_err());
    }

    #[test]
    fn listen_rooms_follow_roles() {
        let s = Ulid::new();
        let m = user(Role::StationMaster { station_id: s });
        assert!(m.may_listen(Room::Station(s)).is_ok());
        assert!(m.may_listen(Room::Admin).is_err());
        assert!(m.may_listen(Room::User(m.user_id().unwrap())).is_ok());
        assert!(m.may_listen(Room::User(Ulid::new())).is_err());
        assert!(Actor::Operator.may_listen(Room::Admin).is_ok());
        assert_eq!(
            m.may_listen(Room::Admin).unwrap_err().sqlstate(),
            "42501"
        );
    }
}
