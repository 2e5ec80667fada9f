//! Capacity ledger. Counts are derived from the unit's booking rows and must be
//! read under the same unit write lock that performs the admission write.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::UnitState;

use super::Rejection;

/// Capacity-holding rows for (unit, date), ignoring `exclude`.
pub(super) fn committed_count(us: &UnitState, date: NaiveDate, exclude: Option<Ulid>) -> u32 {
    us.on_date(date)
        .filter(|b| b.status.holds_capacity() && Some(b.id) != exclude)
        .count() as u32
}

pub(super) fn remaining(us: &UnitState, date: NaiveDate) -> u32 {
    us.capacity.saturating_sub(committed_count(us, date, None))
}

/// Decide whether one more seat fits under `capacity`.
///
/// `Ok(None)` when there is room. With `force`, a full unit yields the smallest
/// ceiling that admits one more seat; the ceiling is never lowered.
pub fn plan_capacity(committed: u32, capacity: u32, force: bool) -> Result<Option<u32>, Rejection> {
    if committed < capacity {
        Ok(None)
    } else if force {
        Ok(Some(committed + 1))
    } else {
        Err(Rejection::Full { capacity })
    }
}
