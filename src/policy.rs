use crate::model::{Book, BookingStatus};

/// Scope of the one-commitment-per-day rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameDayScope {
    /// Any two units conflict.
    Global,
    /// Only units sharing a category conflict.
    PerCategory,
}

/// Holder ↔ unit eligibility predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Anyone may book.
    Open,
    /// The unit category names a role the holder must have been trained for.
    /// Units without a category are open.
    TrainedRole,
}

/// The knobs that make one admission engine behave as a pantry appointment
/// book or a volunteer shift roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    pub book: Book,
    /// Admitted bookings start as `submitted` and wait for staff approval.
    pub requires_approval: bool,
    pub same_day_scope: SameDayScope,
    pub eligibility: Eligibility,
    /// Reject weekend/holiday/blocked dates.
    pub enforce_closures: bool,
    /// Status the sweeper assigns to seats whose date has passed.
    pub elapsed_status: BookingStatus,
}

impl BookingPolicy {
    pub fn pantry() -> Self {
        Self {
            book: Book::Pantry,
            requires_approval: true,
            same_day_scope: SameDayScope::PerCategory,
            eligibility: Eligibility::Open,
            enforce_closures: true,
            elapsed_status: BookingStatus::NoShow,
        }
    }

    pub fn volunteer() -> Self {
        Self {
            book: Book::Volunteer,
            requires_approval: false,
            same_day_scope: SameDayScope::Global,
            eligibility: Eligibility::TrainedRole,
            enforce_closures: true,
            elapsed_status: BookingStatus::Completed,
        }
    }

    pub fn for_book(book: Book) -> Self {
        match book {
            Book::Pantry => Self::pantry(),
            Book::Volunteer => Self::volunteer(),
        }
    }

    pub fn admitted_status(&self) -> BookingStatus {
        if self.requires_approval {
            BookingStatus::Submitted
        } else {
            BookingStatus::Approved
        }
    }

    /// Whether bookings on units with these categories fall under the same-day rule.
    pub fn same_day_applies(&self, a: Option<&str>, b: Option<&str>) -> bool {
        match self.same_day_scope {
            SameDayScope::Global => true,
            SameDayScope::PerCategory => a == b,
        }
    }
}
