use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    BookingConfirmation,
    BookingRescheduled,
    BookingCancelled,
    ActivityNotice,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::BookingConfirmation => "booking_confirmation",
            Template::BookingRescheduled => "booking_rescheduled",
            Template::BookingCancelled => "booking_cancelled",
            Template::ActivityNotice => "activity_notice",
        }
    }
}

/// Calendar event descriptor. The dispatcher renders the actual file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarAttachment {
    pub uid: String,
    pub summary: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub template: Template,
    pub params: serde_json::Value,
    pub attachments: Vec<CalendarAttachment>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// Outbound notification delivery (mail, SMS, ...). Implementations own their
/// retry policy; callers never block a booking on the outcome.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// In-process broadcast hub. Every subscriber sees every notification.
pub struct NotifyHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Dispatcher for NotifyHub {
    /// No-op if nobody is listening.
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError> {
        let _ = self.sender.send(notification.clone());
        Ok(())
    }
}

/// Writes each notification to the log. Used when no delivery service is wired up.
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<(), DispatchError> {
        info!(
            recipient = %notification.recipient,
            template = notification.template.as_str(),
            params = %notification.params,
            attachments = notification.attachments.len(),
            "notification"
        );
        Ok(())
    }
}
