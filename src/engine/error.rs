use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{BookingStatus, Window};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Unit(Ulid),
    Booking(Ulid),
    Series(Ulid),
    Override(Ulid),
    Token,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Unit(id) => write!(f, "unit {id}"),
            Entity::Booking(id) => write!(f, "booking {id}"),
            Entity::Series(id) => write!(f, "series {id}"),
            Entity::Override(id) => write!(f, "override {id}"),
            Entity::Token => write!(f, "token"),
        }
    }
}

/// One side of a same-day collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub booking_id: Option<Ulid>,
    pub unit_id: Ulid,
    pub unit_name: String,
    pub date: NaiveDate,
    pub window: Window,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetail {
    pub attempted: Occurrence,
    pub existing: Occurrence,
}

/// Expected, caller-actionable outcomes. Never logged as faults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("{0} not found")]
    NotFound(Entity),
    #[error("{0} already exists")]
    AlreadyExists(Entity),
    #[error("{holder} is not trained for {role}")]
    Ineligible { holder: String, role: String },
    #[error("closed: {0}")]
    ClosedPeriod(String),
    #[error("already booked for this slot and date")]
    AlreadyBooked,
    #[error("already booked for {} on {}", .0.existing.unit_name, .0.existing.date)]
    SameDayConflict(Box<ConflictDetail>),
    #[error("overlaps {} on {}", .0.existing.unit_name, .0.existing.date)]
    Overlapping(Box<ConflictDetail>),
    #[error("all {capacity} places taken")]
    Full { capacity: u32 },
    #[error("invalid date or time: {0}")]
    InvalidTemporal(String),
    #[error("booking is already {0}")]
    AlreadyTerminal(BookingStatus),
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("a reason is required")]
    ReasonRequired,
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl Rejection {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::NotFound(_) => "not_found",
            Rejection::AlreadyExists(_) => "already_exists",
            Rejection::Ineligible { .. } => "ineligible",
            Rejection::ClosedPeriod(_) => "closed_period",
            Rejection::AlreadyBooked => "already_booked",
            Rejection::SameDayConflict(_) => "same_day_conflict",
            Rejection::Overlapping(_) => "overlapping",
            Rejection::Full { .. } => "full",
            Rejection::InvalidTemporal(_) => "invalid_temporal",
            Rejection::AlreadyTerminal(_) => "already_terminal",
            Rejection::InvalidTransition { .. } => "invalid_transition",
            Rejection::ReasonRequired => "reason_required",
            Rejection::Forbidden(_) => "forbidden",
            Rejection::LimitExceeded(_) => "limit_exceeded",
        }
    }

    pub fn conflict(&self) -> Option<&ConflictDetail> {
        match self {
            Rejection::SameDayConflict(detail) | Rejection::Overlapping(detail) => Some(detail),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            EngineError::WalError(_) => None,
        }
    }
}

pub(crate) fn not_found(entity: Entity) -> EngineError {
    EngineError::Rejected(Rejection::NotFound(entity))
}
