use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in minor units (cents).
pub type Cents = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

// ── Booking ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    PendingConfirmation,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

str_enum!(BookingStatus, "booking status", {
    PendingConfirmation => "pending-confirmation",
    Confirmed => "confirmed",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl BookingStatus {
    /// Live bookings hold their slot on the vehicle.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            BookingStatus::PendingConfirmation | BookingStatus::Confirmed | BookingStatus::Active
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

str_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationKind {
    Extend,
    Shorten,
}

str_enum!(ModificationKind, "modification type", {
    Extend => "extend",
    Shorten => "shorten",
});

/// Why a booking ended up cancelled. Drives the message the renter sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    Manual,
    Unconfirmed,
    PaymentTimeout,
    AdminOverride,
}

str_enum!(CancelReason, "cancel reason", {
    Manual => "manual",
    Unconfirmed => "unconfirmed",
    PaymentTimeout => "payment-timeout",
    AdminOverride => "admin-override",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationKind,
    pub old_end: Ms,
    pub new_end: Ms,
    /// Negative when shortening.
    pub additional_cost: Cents,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub vehicle_id: Ulid,
    /// Denormalized from the vehicle.
    pub station_id: Ulid,
    pub span: Span,
    pub original_end: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub total_cost: Cents,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<String>,
    /// Set only when the booking is confirmed.
    pub payment_deadline: Option<Ms>,
    /// Append-only.
    pub modifications: Vec<Modification>,
    pub emergency_contacts: Vec<String>,
    pub cancel_reason: Option<CancelReason>,
    pub reminder_sent: bool,
    /// Bumped on every write.
    pub version: u64,
}

impl Booking {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Active ride whose reserved end has already passed.
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.status == BookingStatus::Active && self.span.end <= now
    }
}

// ── Vehicle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleStatus {
    Available,
    Reserved,
    InUse,
    Maintenance,
}

str_enum!(VehicleStatus, "vehicle status", {
    Available => "available",
    Reserved => "reserved",
    InUse => "in-use",
    Maintenance => "maintenance",
});

/// The stored vehicle document. Status is never stored; see
/// `engine::availability::project_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub station_id: Ulid,
    pub model_name: String,
    pub image_url: Option<String>,
    pub price_per_hour: Cents,
    /// Manual maintenance hold set by staff.
    pub maintenance: bool,
    pub created_at: Ms,
}

/// A vehicle plus every booking that ever referenced it.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// Sorted by `span.start`. Cancelled and completed bookings stay for history.
    pub bookings: Vec<Booking>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            bookings: Vec::new(),
        }
    }

    /// Insert or replace a booking, keeping sort order by start.
    pub fn put_booking(&mut self, booking: Booking) {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == booking.id) {
            if self.bookings[pos].span.start == booking.span.start {
                self.bookings[pos] = booking;
                return;
            }
            self.bookings.remove(pos);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| &b.id == id)
    }

    /// Bookings whose span overlaps the query window, regardless of status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn live_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_live())
    }
}

// ── Station & users ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: Ulid,
    pub name: String,
    pub location: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Customer,
    StationMaster { station_id: Ulid },
    SuperAdmin,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::StationMaster { .. } => "station-master",
            Role::SuperAdmin => "super-admin",
        }
    }

    pub fn station_id(&self) -> Option<Ulid> {
        match self {
            Role::StationMaster { station_id } => Some(*station_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
    pub active: bool,
    pub created_at: Ms,
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Booking,
    Payment,
    Reminder,
    Account,
    System,
}

str_enum!(NotificationKind, "notification type", {
    Booking => "booking",
    Payment => "payment",
    Reminder => "reminder",
    Account => "account",
    System => "system",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

str_enum!(Priority, "priority", {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    InApp,
    Push,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub channels: Vec<Channel>,
    pub read: bool,
    pub created_at: Ms,
    pub expires_at: Ms,
}

/// The event types: whole-document writes. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StationPut(Station),
    StationDeleted { id: Ulid },
    UserPut(User),
    VehiclePut(Vehicle),
    VehicleDeleted { id: Ulid },
    BookingPut(Booking),
    NotificationPut(NotificationRecord),
    NotificationsPurged { before: Ms },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub station_id: Ulid,
    pub model_name: String,
    pub image_url: Option<String>,
    pub price_per_hour: Cents,
    pub status: VehicleStatus,
    pub available_after: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedSlot {
    pub booking_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardInfo {
    pub station_id: Ulid,
    pub total_vehicles: usize,
    pub available: usize,
    pub reserved: usize,
    pub in_use: usize,
    pub maintenance: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub active: usize,
    /// Active bookings whose end time has passed.
    pub overdue: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPage {
    pub items: Vec<NotificationRecord>,
    pub total: usize,
    pub unread: usize,
    pub page: usize,
    pub per_page: usize,
}
