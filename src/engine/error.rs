use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("station name already taken: {0}")]
    NameTaken(String),
    /// Malformed or out-of-policy request.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("time slot conflicts with booking {0}")]
    Conflict(Ulid),
    #[error("cannot move booking from {from} to {to}")]
    IllegalTransition { from: BookingStatus, to: BookingStatus },
    #[error("cannot start ride: payment not completed")]
    PaymentRequired,
    #[error("booking {id} is {status}; only pending-confirmation or confirmed bookings can be modified")]
    NotModifiable { id: Ulid, status: BookingStatus },
    #[error("stale booking version: expected {expected}, found {found}")]
    StaleVersion { expected: u64, found: u64 },
    #[error("station {0} has no active station-master")]
    StationUnmanaged(Ulid),
    #[error("vehicle {0} is under maintenance")]
    UnderMaintenance(Ulid),
    #[error("vehicle {0} still has live bookings")]
    HasLiveBookings(Ulid),
    #[error("station {0} still has vehicles")]
    HasVehicles(Ulid),
    #[error("booking deadline passed at {0}")]
    DeadlinePassed(Ms),
    #[error("booking {0} has not expired")]
    NotExpired(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// SQLSTATE reported at the wire boundary. Client mistakes, slot
    /// conflicts and lifecycle guards get distinct classes.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) | EngineError::NameTaken(_) => "23505",
            EngineError::Validation(_)
            | EngineError::UnderMaintenance(_)
            | EngineError::StationUnmanaged(_)
            | EngineError::DeadlinePassed(_) => "22023",
            EngineError::Conflict(_) => "23P01",
            EngineError::IllegalTransition { .. }
            | EngineError::PaymentRequired
            | EngineError::NotModifiable { .. }
            | EngineError::NotExpired(_)
            | EngineError::HasLiveBookings(_)
            | EngineError::HasVehicles(_) => "55000",
            EngineError::StaleVersion { .. } => "40001",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_names_both_states() {
        let e = EngineError::IllegalTransition {
            from: BookingStatus::Completed,
            to: BookingStatus::Cancelled,
        };
        assert_eq!(e.to_string(), "cannot move booking from completed to cancelled");
    }

    #[test]
    fn conflict_and_validation_are_distinct_classes() {
        let conflict = EngineError::Conflict(Ulid::new());
        let invalid = EngineError::validation("too short");
        assert_ne!(conflict.sqlstate(), invalid.sqlstate());
        assert_eq!(invalid.to_string(), "invalid request: too short");
    }
}
