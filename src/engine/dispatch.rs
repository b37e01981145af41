use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{PushError, PushKind, PushMessage, Room};
use crate::observability;

use super::{Engine, EngineError};

/// Renter-facing message attached to a booking change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Notice {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub channels: Vec<Channel>,
}

impl Notice {
    fn new(title: &str, message: String, priority: Priority) -> Self {
        Self {
            title: title.to_string(),
            message,
            kind: NotificationKind::Booking,
            priority,
            channels: default_channels(),
        }
    }
}

fn default_channels() -> Vec<Channel> {
    vec![Channel::InApp, Channel::Push]
}

/// Message for a booking that just entered its current status.
pub(crate) fn transition_notice(b: &Booking, model: &str) -> Notice {
    match b.status {
        BookingStatus::PendingConfirmation => Notice::new(
            "Booking received",
            format!("Your booking for {model} is awaiting confirmation from the station."),
            Priority::Normal,
        ),
        BookingStatus::Confirmed => {
            let mut n = Notice::new(
                "Booking confirmed",
                format!(
                    "Your booking for {model} is confirmed. Complete payment within {} minutes to keep it.",
                    (b.payment_deadline.unwrap_or(b.updated_at) - b.updated_at) / MINUTE_MS
                ),
                Priority::High,
            );
            n.channels.push(Channel::Email);
            n
        }
        BookingStatus::Active => Notice::new(
            "Ride started",
            format!("Your ride in {model} has started. Drive safely!"),
            Priority::Normal,
        ),
        BookingStatus::Completed => Notice::new(
            "Ride completed",
            format!("Thanks for riding {model}. Your booking is complete."),
            Priority::Normal,
        ),
        BookingStatus::Cancelled => {
            let message = match b.cancel_reason {
                Some(CancelReason::PaymentTimeout) => format!(
                    "Your booking for {model} was cancelled because payment was not received in time."
                ),
                Some(CancelReason::Unconfirmed) => format!(
                    "Your booking for {model} was cancelled because the station did not confirm it in time."
                ),
                Some(CancelReason::AdminOverride) => format!(
                    "Your booking for {model} was cancelled by an administrator."
                ),
                Some(CancelReason::Manual) | None => {
                    format!("Your booking for {model} was cancelled by the station.")
                }
            };
            Notice::new("Booking cancelled", message, Priority::High)
        }
    }
}

pub(crate) fn modification_notice(before: &Booking, after: &Booking, model: &str) -> Notice {
    let minutes = (after.span.end - before.span.end).abs() / MINUTE_MS;
    let verb = if after.span.end > before.span.end {
        "extended"
    } else {
        "shortened"
    };
    Notice::new(
        "Booking updated",
        format!(
            "Your booking for {model} was {verb} by {minutes} minutes. New total: {}.",
            format_cents(after.total_cost)
        ),
        Priority::Normal,
    )
}

pub(crate) fn payment_notice(b: &Booking, model: &str) -> Notice {
    let mut n = match b.payment_status {
        PaymentStatus::Completed => Notice::new(
            "Payment received",
            format!(
                "We received {} for your booking of {model}.",
                format_cents(b.total_cost)
            ),
            Priority::Normal,
        ),
        _ => Notice::new(
            "Payment failed",
            format!("Payment for your booking of {model} failed. Please try again."),
            Priority::High,
        ),
    };
    n.kind = NotificationKind::Payment;
    n
}

fn format_cents(c: Cents) -> String {
    let sign = if c < 0 { "-" } else { "" };
    format!("{sign}{}.{:02}", c.abs() / 100, c.abs() % 100)
}

fn booking_payload(b: &Booking) -> serde_json::Value {
    json!({
        "booking_id": b.id.to_string(),
        "vehicle_id": b.vehicle_id.to_string(),
        "status": b.status.as_str(),
        "payment_status": b.payment_status.as_str(),
        "version": b.version,
    })
}

impl Engine {
    /// Persist an inbox record and deliver it on the requested channels.
    /// The record is always stored; push and email are best-effort.
    pub async fn notify(
        &self,
        user_id: Ulid,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        priority: Priority,
        channels: Option<Vec<Channel>>,
    ) -> Result<NotificationRecord, EngineError> {
        let now = self.now();
        let mut channels = channels.unwrap_or_else(default_channels);
        if !channels.contains(&Channel::InApp) {
            channels.insert(0, Channel::InApp);
        }
        let record = NotificationRecord {
            id: Ulid::new(),
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            priority,
            channels,
            read: false,
            created_at: now,
            expires_at: now + self.policy.notification_ttl_ms,
        };
        self.commit(&Event::NotificationPut(record.clone()), |store| {
            store.put_notification(record.clone())
        })
        .await?;
        metrics::counter!(observability::NOTIFICATIONS_TOTAL, "kind" => kind.as_str()).increment(1);

        if record.channels.contains(&Channel::Push) {
            let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
            self.push_best_effort(Room::User(user_id), PushMessage::new(PushKind::Notification, payload))
                .await;
        }
        if record.channels.contains(&Channel::Email)
            && let Err(e) = self.push.queue_email(user_id, &record.title, &record.message).await
        {
            tracing::warn!(user = %user_id, error = %e, "email not queued");
        }
        Ok(record)
    }

    pub(super) async fn push_best_effort(&self, room: Room, message: PushMessage) {
        match self.push.push(room, message).await {
            Ok(()) => {}
            Err(PushError::NoListeners(room)) => {
                metrics::counter!(observability::PUSH_MISSES_TOTAL, "reason" => "no_listeners")
                    .increment(1);
                tracing::debug!(%room, "push dropped: nobody listening");
            }
            Err(e) => {
                metrics::counter!(observability::PUSH_MISSES_TOTAL, "reason" => "transport")
                    .increment(1);
                tracing::warn!(%room, error = %e, "push failed");
            }
        }
    }

    /// Side effects of a booking write: renter notice, `booking_update` to
    /// the renter, `dashboard_refresh` to the station and the admins.
    /// Never fails the caller.
    pub(super) async fn announce(&self, booking: &Booking, n: Notice) {
        if let Err(e) = self
            .notify(booking.user_id, n.title, n.message, n.kind, n.priority, Some(n.channels))
            .await
        {
            tracing::warn!(booking = %booking.id, error = %e, "notification not stored");
        }
        self.push_best_effort(
            Room::User(booking.user_id),
            PushMessage::new(PushKind::BookingUpdate, booking_payload(booking)),
        )
        .await;
        self.refresh_dashboards(booking.station_id).await;
    }

    pub(super) async fn refresh_dashboards(&self, station_id: Ulid) {
        self.push_best_effort(Room::Station(station_id), PushMessage::dashboard_refresh())
            .await;
        self.push_best_effort(Room::Admin, PushMessage::dashboard_refresh())
            .await;
    }

    pub(super) async fn remind(&self, booking: &Booking, model: &str) {
        let minutes = (booking.span.start - self.now()).max(0) / MINUTE_MS;
        let message = format!("Your {model} booking starts in {minutes} minutes.");
        if let Err(e) = self
            .notify(
                booking.user_id,
                "Upcoming booking",
                message,
                NotificationKind::Reminder,
                Priority::High,
                Some(vec![Channel::InApp]),
            )
            .await
        {
            tracing::warn!(booking = %booking.id, error = %e, "reminder not stored");
        }
        let mut payload = booking_payload(booking);
        payload["starts_at"] = json!(booking.span.start);
        self.push_best_effort(
            Room::User(booking.user_id),
            PushMessage::new(PushKind::BookingReminder, payload),
        )
        .await;
    }

    // ── Inbox ────────────────────────────────────────────────

    /// Newest first, expired records hidden. `page` is 1-based.
    pub fn list_notifications(&self, user_id: Ulid, page: usize, per_page: usize) -> NotificationPage {
        let now = self.now();
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let page = page.max(1);
        let mut visible: Vec<NotificationRecord> = self
            .store
            .notifications_for(&user_id)
            .into_iter()
            .filter(|n| n.expires_at > now)
            .collect();
        visible.reverse();
        let total = visible.len();
        let unread = visible.iter().filter(|n| !n.read).count();
        let items = visible
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        NotificationPage {
            items,
            total,
            unread,
            page,
            per_page,
        }
    }

    pub async fn mark_notification_read(
        &self,
        user_id: Ulid,
        id: Ulid,
    ) -> Result<NotificationRecord, EngineError> {
        let mut record = self
            .store
            .notification(&user_id, &id)
            .ok_or(EngineError::NotFound(id))?;
        if record.read {
            return Ok(record);
        }
        record.read = true;
        self.commit(&Event::NotificationPut(record.clone()), |store| {
            store.put_notification(record.clone())
        })
        .await?;
        Ok(record)
    }

    /// Returns how many records flipped to read.
    pub async fn mark_all_notifications_read(&self, user_id: Ulid) -> Result<usize, EngineError> {
        let unread: Vec<NotificationRecord> = self
            .store
            .notifications_for(&user_id)
            .into_iter()
            .filter(|n| !n.read)
            .collect();
        for mut record in unread.iter().cloned() {
            record.read = true;
            self.commit(&Event::NotificationPut(record.clone()), |store| {
                store.put_notification(record)
            })
            .await?;
        }
        Ok(unread.len())
    }

    /// Drop records whose expiry has passed. Returns how many were removed.
    pub async fn purge_expired_notifications(&self, now: Ms) -> Result<usize, EngineError> {
        if self.store.count_expired_notifications(now) == 0 {
            return Ok(0);
        }
        self.commit(&Event::NotificationsPurged { before: now }, |store| {
            store.purge_notifications(now)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_render_with_two_decimals() {
        assert_eq!(format_cents(12_345), "123.45");
        assert_eq!(format_cents(-1_500), "-15.00");
        assert_eq!(format_cents(7), "0.07");
    }

    #[test]
    fn cancellation_text_depends_on_reason() {
        let mut b = Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            vehicle_id: Ulid::new(),
            station_id: Ulid::new(),
            span: Span::new(0, HOUR_MS),
            original_end: HOUR_MS,
            created_at: 0,
            updated_at: 0,
            total_cost: 0,
            status: BookingStatus::Cancelled,
            payment_status: PaymentStatus::Failed,
            payment_id: None,
            payment_deadline: None,
            modifications: vec![],
            emergency_contacts: vec![],
            cancel_reason: Some(CancelReason::PaymentTimeout),
            reminder_sent: false,
            version: 2,
        };
        let timeout = transition_notice(&b, "Zoe");
        assert!(timeout.message.contains("payment"));
        b.cancel_reason = Some(CancelReason::AdminOverride);
        let admin = transition_notice(&b, "Zoe");
        assert!(admin.message.contains("administrator"));
        assert_ne!(timeout.message, admin.message);
    }

    #[test]
    fn confirmation_also_emails() {
        let b = Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            vehicle_id: Ulid::new(),
            station_id: Ulid::new(),
            span: Span::new(0, HOUR_MS),
            original_end: HOUR_MS,
            created_at: 0,
            updated_at: 1_000,
            total_cost: 0,
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Pending,
            payment_id: None,
            payment_deadline: Some(1_000 + 15 * MINUTE_MS),
            modifications: vec![],
            emergency_contacts: vec![],
            cancel_reason: None,
            reminder_sent: false,
            version: 2,
        };
        let n = transition_notice(&b, "Zoe");
        assert!(n.channels.contains(&Channel::Email));
        assert!(n.message.contains("15 minutes"));
    }
}
