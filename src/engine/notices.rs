//! Post-commit notifications. Built from committed rows and dispatched on a
//! spawned task; a failed dispatch never reaches the caller.

use serde_json::json;
use tracing::warn;

use crate::model::Booking;
use crate::notify::{CalendarAttachment, Notification, Template};
use crate::observability::NOTIFICATIONS_FAILED_TOTAL;

use super::admission::UnitSnapshot;
use super::{Engine, Occurrence};

/// Recipient of operational activity notices.
pub const OPERATIONS_RECIPIENT: &str = "operations";

impl Engine {
    fn link(&self, action: &str, token: &str) -> String {
        format!(
            "{}/{}/{action}?token={token}",
            self.public_url.trim_end_matches('/'),
            self.policy.book.as_str()
        )
    }

    fn attachment(&self, booking: &Booking, unit: &UnitSnapshot, cancelled: bool) -> CalendarAttachment {
        CalendarAttachment {
            uid: booking.id.to_string(),
            summary: unit.name.clone(),
            date: booking.date,
            start: unit.window.start,
            end: unit.window.end,
            cancelled,
        }
    }

    fn booking_params(&self, booking: &Booking, unit: &UnitSnapshot) -> serde_json::Value {
        let mut params = json!({
            "book": self.policy.book.as_str(),
            "booking_id": booking.id.to_string(),
            "unit": unit.name,
            "date": booking.date.to_string(),
            "start": unit.window.start.format("%H:%M").to_string(),
            "end": unit.window.end.format("%H:%M").to_string(),
            "status": booking.status.as_str(),
        });
        if let Some(token) = &booking.token {
            params["cancel_link"] = json!(self.link("cancel", token));
            params["reschedule_link"] = json!(self.link("reschedule", token));
        }
        if let Some(reason) = &booking.reason {
            params["reason"] = json!(reason);
        }
        params
    }

    fn activity(&self, action: &str, booking: &Booking, unit: &UnitSnapshot) -> Notification {
        Notification {
            recipient: OPERATIONS_RECIPIENT.to_string(),
            template: Template::ActivityNotice,
            params: json!({
                "action": action,
                "book": self.policy.book.as_str(),
                "holder": booking.holder,
                "unit": unit.name,
                "date": booking.date.to_string(),
                "status": booking.status.as_str(),
            }),
            attachments: vec![],
        }
    }

    pub(super) fn notify_admitted(&self, booking: &Booking, unit: &UnitSnapshot) {
        let confirmation = Notification {
            recipient: booking.holder.clone(),
            template: Template::BookingConfirmation,
            params: self.booking_params(booking, unit),
            attachments: vec![self.attachment(booking, unit, false)],
        };
        let activity = self.activity("admitted", booking, unit);
        self.dispatch(vec![confirmation, activity]);
    }

    pub(super) fn notify_rescheduled(&self, booking: &Booking, previous: &Occurrence, unit: &UnitSnapshot) {
        let mut params = self.booking_params(booking, unit);
        params["previous_unit"] = json!(previous.unit_name);
        params["previous_date"] = json!(previous.date.to_string());
        params["previous_start"] = json!(previous.window.start.format("%H:%M").to_string());
        params["previous_end"] = json!(previous.window.end.format("%H:%M").to_string());
        let rescheduled = Notification {
            recipient: booking.holder.clone(),
            template: Template::BookingRescheduled,
            params,
            attachments: vec![self.attachment(booking, unit, false)],
        };
        let activity = self.activity("rescheduled", booking, unit);
        self.dispatch(vec![rescheduled, activity]);
    }

    pub(super) fn notify_cancelled(&self, booking: &Booking, unit: &UnitSnapshot) {
        let cancelled = Notification {
            recipient: booking.holder.clone(),
            template: Template::BookingCancelled,
            params: self.booking_params(booking, unit),
            attachments: vec![self.attachment(booking, unit, true)],
        };
        let activity = self.activity(booking.status.as_str(), booking, unit);
        self.dispatch(vec![cancelled, activity]);
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            for note in notes {
                if let Err(e) = dispatcher.dispatch(&note).await {
                    metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    warn!(
                        recipient = %note.recipient,
                        template = note.template.as_str(),
                        error = %e,
                        "notification dispatch failed"
                    );
                }
            }
        });
    }
}
