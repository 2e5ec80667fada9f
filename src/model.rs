use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Which of the two booking books a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Book {
    /// Shopper appointment slots.
    Pantry,
    /// Volunteer shifts.
    Volunteer,
}

impl Book {
    pub fn as_str(&self) -> &'static str {
        match self {
            Book::Pantry => "pantry",
            Book::Volunteer => "volunteer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pantry" => Some(Book::Pantry),
            "volunteer" | "volunteers" => Some(Book::Volunteer),
            _ => None,
        }
    }
}

/// Half-open daily time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Window {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_window(&self, other: &Window) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Submitted,
    Approved,
    Rejected,
    Cancelled,
    NoShow,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Submitted => "submitted",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "submitted" => Some(BookingStatus::Submitted),
            "approved" => Some(BookingStatus::Approved),
            "rejected" => Some(BookingStatus::Rejected),
            "cancelled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }

    /// Occupies a seat against the unit ceiling.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, BookingStatus::Submitted | BookingStatus::Approved)
    }

    /// Counts towards the one-active-booking-per-(unit, date, holder) rule.
    /// Cancelled and rejected rows may be reused by a later admission.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Rejected)
    }

    /// No further staff transitions out of this status.
    pub fn is_terminal(&self) -> bool {
        !self.holds_capacity()
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Submitted, Approved)
                | (Submitted, Rejected)
                | (Submitted, Cancelled)
                | (Approved, Cancelled)
                | (Approved, NoShow)
                | (Approved, Completed)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identity's claim on one (unit, date) pair. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub holder: String,
    pub date: NaiveDate,
    pub status: BookingStatus,
    pub note: Option<String>,
    /// Single-use guest credential. Cleared once the booking leaves a
    /// capacity-holding status.
    pub token: Option<String>,
    pub series_id: Option<Ulid>,
    pub reason: Option<String>,
}

/// A recurring daily time window with a capacity ceiling, plus every booking row
/// that references it.
#[derive(Debug, Clone)]
pub struct UnitState {
    pub id: Ulid,
    pub name: String,
    /// Visit type for pantry slots, required role for volunteer shifts.
    pub category: Option<String>,
    pub window: Window,
    /// Ceiling. Only ever raised after creation, by forced admission.
    pub capacity: u32,
    pub active: bool,
    /// Booking rows, sorted by `date`.
    pub bookings: Vec<Booking>,
}

impl UnitState {
    pub fn new(id: Ulid, name: String, category: Option<String>, window: Window, capacity: u32) -> Self {
        Self {
            id,
            name,
            category,
            window,
            capacity,
            active: true,
            bookings: Vec::new(),
        }
    }

    /// Insert a booking keeping date order; replaces a row with the same id.
    pub fn upsert_booking(&mut self, booking: Booking) {
        if let Some(existing) = self.bookings.iter_mut().find(|b| b.id == booking.id) {
            if existing.date == booking.date {
                *existing = booking;
                return;
            }
            let id = booking.id;
            self.remove_booking(id);
        }
        let pos = self.bookings.partition_point(|b| b.date <= booking.date);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Rows on `date`, found by binary search.
    pub fn on_date(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        self.bookings[lo..hi].iter()
    }

    /// Rows with `from <= date <= to`.
    pub fn in_range(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.date < from);
        let hi = self.bookings.partition_point(|b| b.date <= to);
        self.bookings[lo..hi.max(lo)].iter()
    }

    /// The holder's active row for `date`, ignoring `exclude`.
    pub fn active_for(&self, date: NaiveDate, holder: &str, exclude: Option<Ulid>) -> Option<&Booking> {
        self.on_date(date)
            .find(|b| b.holder == holder && b.status.is_active() && Some(b.id) != exclude)
    }

    /// A cancelled or rejected row for (date, holder) whose id can be reused.
    pub fn reusable_for(&self, date: NaiveDate, holder: &str) -> Option<Ulid> {
        self.on_date(date)
            .find(|b| b.holder == holder && !b.status.is_active())
            .map(|b| b.id)
    }

    pub fn to_info(&self) -> UnitInfo {
        UnitInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            window: self.window,
            capacity: self.capacity,
            active: self.active,
        }
    }
}

/// Staff-authored availability exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Override {
    /// One unit closed on one date.
    Block {
        unit_id: Ulid,
        date: NaiveDate,
        reason: String,
    },
    /// One unit closed on the n-th given weekday of every month.
    RecurringBlock {
        unit_id: Ulid,
        weekday: Weekday,
        week: u32,
        reason: String,
    },
    /// One unit closed on every given weekday.
    Break {
        unit_id: Ulid,
        weekday: Weekday,
        reason: String,
    },
    /// Whole organization closed on one date.
    Holiday { date: NaiveDate, reason: String },
}

impl Override {
    pub fn unit_id(&self) -> Option<Ulid> {
        match self {
            Override::Block { unit_id, .. }
            | Override::RecurringBlock { unit_id, .. }
            | Override::Break { unit_id, .. } => Some(*unit_id),
            Override::Holiday { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Override::Block { reason, .. }
            | Override::RecurringBlock { reason, .. }
            | Override::Break { reason, .. }
            | Override::Holiday { reason, .. } => reason,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Override::Block { .. } => "block",
            Override::RecurringBlock { .. } => "recurring_block",
            Override::Break { .. } => "break",
            Override::Holiday { .. } => "holiday",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Daily,
    /// Weekdays kept sorted Monday-first, without duplicates.
    Weekly(Vec<Weekday>),
}

impl Pattern {
    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Pattern::Weekly(days)
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            Pattern::Daily => true,
            Pattern::Weekly(days) => days.contains(&date.weekday()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Pattern::Daily => "daily",
            Pattern::Weekly(_) => "weekly",
        }
    }
}

/// A holder's request to book one unit repeatedly across a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: Ulid,
    pub holder: String,
    pub unit_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub pattern: Pattern,
    pub active: bool,
}

/// Who is asking. Only staff may force, change statuses, or act for others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Staff,
    Holder(String),
}

impl Actor {
    pub fn is_staff(&self) -> bool {
        matches!(self, Actor::Staff)
    }

    pub fn may_act_for(&self, holder: &str) -> bool {
        match self {
            Actor::Staff => true,
            Actor::Holder(h) => h == holder,
        }
    }
}

/// The WAL record format. Flat: one operation per event.
/// Multi-row writes that must land together are a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UnitCreated {
        id: Ulid,
        name: String,
        category: Option<String>,
        window: Window,
        capacity: u32,
    },
    UnitUpdated {
        id: Ulid,
        name: String,
        active: bool,
    },
    OverrideAdded {
        id: Ulid,
        rule: Override,
    },
    OverrideRemoved {
        id: Ulid,
    },
    RoleGranted {
        holder: String,
        role: String,
    },
    RoleRevoked {
        holder: String,
        role: String,
    },
    /// Insert, or reuse of a cancelled row with the same id.
    BookingAdmitted {
        booking: Booking,
        raised_to: Option<u32>,
    },
    StatusChanged {
        id: Ulid,
        unit_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
    BookingMoved {
        id: Ulid,
        from_unit: Ulid,
        to_unit: Ulid,
        date: NaiveDate,
        status: BookingStatus,
        token: String,
    },
    ConflictResolved {
        cancelled_id: Ulid,
        cancelled_unit: Ulid,
        admitted: Booking,
        raised_to: Option<u32>,
    },
    SeriesAdmitted {
        series: Series,
        bookings: Vec<Booking>,
        raised_to: Option<u32>,
    },
    /// `unit_id` is the series' unit; `cancelled` may include rows rescheduled elsewhere.
    SeriesCancelled {
        id: Ulid,
        unit_id: Ulid,
        from: NaiveDate,
        reason: String,
        cancelled: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub window: Window,
    pub capacity: u32,
    pub active: bool,
}
