//! Hard limits and booking policy defaults.

use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

// ── Hard limits ──────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_EMERGENCY_CONTACTS: usize = 5;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_MODIFICATIONS_PER_BOOKING: usize = 64;
pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_VEHICLE: usize = 50_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
pub const MAX_PER_PAGE: usize = 100;
pub const DEFAULT_PER_PAGE: usize = 20;
/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

// ── Booking policy defaults ──────────────────────────────────────

pub const DEFAULT_LEAD_TIME_MS: Ms = 30 * MINUTE_MS;
pub const DEFAULT_MIN_DURATION_MS: Ms = HOUR_MS;
pub const DEFAULT_MAX_DURATION_MS: Ms = 168 * HOUR_MS;
pub const DEFAULT_OPEN_HOUR: u8 = 6;
pub const DEFAULT_CLOSE_HOUR: u8 = 23;
pub const DEFAULT_UNCONFIRMED_TTL_MS: Ms = 15 * MINUTE_MS;
pub const DEFAULT_PAYMENT_WINDOW_MS: Ms = 15 * MINUTE_MS;
pub const DEFAULT_REMINDER_LEAD_MS: Ms = 60 * MINUTE_MS;
pub const DEFAULT_NOTIFICATION_TTL_MS: Ms = 30 * DAY_MS;

/// Per-tenant booking rules. Everything the lifecycle guards compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Minimum gap between now and the reserved start.
    pub lead_time_ms: Ms,
    pub min_duration_ms: Ms,
    pub max_duration_ms: Ms,
    /// Stations open at this local hour...
    pub open_hour: u8,
    /// ...and close at this one. 24 means midnight.
    pub close_hour: u8,
    /// Offset of station-local time from UTC.
    pub utc_offset_ms: Ms,
    pub unconfirmed_ttl_ms: Ms,
    pub payment_window_ms: Ms,
    pub reminder_lead_ms: Ms,
    pub notification_ttl_ms: Ms,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            lead_time_ms: DEFAULT_LEAD_TIME_MS,
            min_duration_ms: DEFAULT_MIN_DURATION_MS,
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
            open_hour: DEFAULT_OPEN_HOUR,
            close_hour: DEFAULT_CLOSE_HOUR,
            utc_offset_ms: 0,
            unconfirmed_ttl_ms: DEFAULT_UNCONFIRMED_TTL_MS,
            payment_window_ms: DEFAULT_PAYMENT_WINDOW_MS,
            reminder_lead_ms: DEFAULT_REMINDER_LEAD_MS,
            notification_ttl_ms: DEFAULT_NOTIFICATION_TTL_MS,
        }
    }
}

impl Policy {
    /// Milliseconds since local midnight for an instant.
    pub fn time_of_day(&self, t: Ms) -> Ms {
        (t + self.utc_offset_ms).rem_euclid(DAY_MS)
    }

    /// Local midnight (as a UTC instant) of the day containing `t`.
    pub fn day_start(&self, t: Ms) -> Ms {
        t - self.time_of_day(t)
    }

    pub fn opens_at_ms(&self) -> Ms {
        self.open_hour as Ms * HOUR_MS
    }

    pub fn closes_at_ms(&self) -> Ms {
        self.close_hour as Ms * HOUR_MS
    }

    /// Pickups and returns may only happen while the station is open,
    /// closing time inclusive.
    pub fn within_operating_hours(&self, t: Ms) -> bool {
        let tod = self.time_of_day(t);
        tod >= self.opens_at_ms() && tod <= self.closes_at_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY0: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    #[test]
    fn operating_hours_inclusive_at_close() {
        let p = Policy::default();
        assert!(p.within_operating_hours(DAY0 + 6 * HOUR_MS));
        assert!(p.within_operating_hours(DAY0 + 23 * HOUR_MS));
        assert!(!p.within_operating_hours(DAY0 + 23 * HOUR_MS + 1));
        assert!(!p.within_operating_hours(DAY0 + 5 * HOUR_MS + 59 * MINUTE_MS));
    }

    #[test]
    fn utc_offset_shifts_local_day() {
        let p = Policy {
            utc_offset_ms: 2 * HOUR_MS,
            ..Policy::default()
        };
        // 04:00 UTC is 06:00 local
        assert!(p.within_operating_hours(DAY0 + 4 * HOUR_MS));
        assert!(!p.within_operating_hours(DAY0 + 3 * HOUR_MS));
        assert_eq!(p.day_start(DAY0 + 4 * HOUR_MS), DAY0 - 2 * HOUR_MS);
    }

    #[test]
    fn round_the_clock_policy() {
        let p = Policy {
            open_hour: 0,
            close_hour: 24,
            ..Policy::default()
        };
        assert!(p.within_operating_hours(DAY0));
        assert!(p.within_operating_hours(DAY0 + 23 * HOUR_MS + 59 * MINUTE_MS));
    }
}
