use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::token;

use super::admission::{check_text_limits, UnitSnapshot};
use super::error::not_found;
use super::ledger::{committed_count, plan_capacity};
use super::{Engine, EngineError, Entity, Rejection, UnitLocks};

/// Which side of a same-day collision survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keep {
    Existing,
    /// Replace the existing booking with one on `unit_id`/`date`.
    New {
        unit_id: Ulid,
        date: NaiveDate,
        note: Option<String>,
        force: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub existing_id: Ulid,
    pub keep: Keep,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeptExisting(Booking),
    KeptNew {
        booking: Booking,
        cancelled: Booking,
        raised_to: Option<u32>,
    },
}

impl Resolution {
    pub fn kept(&self) -> &'static str {
        match self {
            Resolution::KeptExisting(_) => "existing",
            Resolution::KeptNew { .. } => "new",
        }
    }

    pub fn booking(&self) -> &Booking {
        match self {
            Resolution::KeptExisting(b) | Resolution::KeptNew { booking: b, .. } => b,
        }
    }
}

fn different_day(existing: NaiveDate) -> Rejection {
    Rejection::InvalidTemporal(format!("replacement must be on {existing}, the day of the existing booking"))
}

impl Engine {
    pub async fn resolve_conflict(&self, req: ResolveRequest) -> Result<Resolution, EngineError> {
        let existing = self.get_booking(req.existing_id).await?;
        if !req.actor.may_act_for(&existing.holder) {
            return Err(Rejection::Forbidden("holders may only resolve their own bookings").into());
        }
        let Keep::New { unit_id, date, note, force } = req.keep else {
            return Ok(Resolution::KeptExisting(existing));
        };
        let force = force && req.actor.is_staff();

        let result = self.replace(existing, unit_id, date, note, force).await;
        self.record_admission(result.as_ref().map(|(r, _, _)| r.booking()));
        let (resolution, new_unit, old_unit) = result?;
        if let Resolution::KeptNew { booking, cancelled, .. } = &resolution {
            self.notify_cancelled(cancelled, &old_unit);
            self.notify_admitted(booking, &new_unit);
        }
        Ok(resolution)
    }

    /// Cancel `existing` with reason `conflict` and admit the holder on the new
    /// (unit, date) in one write, or leave both untouched.
    async fn replace(
        &self,
        existing: Booking,
        unit_id: Ulid,
        date: NaiveDate,
        note: Option<String>,
        force: bool,
    ) -> Result<(Resolution, UnitSnapshot, UnitSnapshot), EngineError> {
        if !existing.status.holds_capacity() {
            return Err(Rejection::AlreadyTerminal(existing.status).into());
        }
        if existing.date != date {
            return Err(different_day(existing.date).into());
        }
        check_text_limits(&existing.holder, note.as_deref())?;
        let holder = existing.holder.clone();

        let unit = self.unit_snapshot(&unit_id).await?;
        self.check_temporal(&unit, date)?;
        self.check_eligible(&holder, &unit)?;
        self.check_open(&unit, date).await?;
        let commitments = self
            .holder_commitments(&holder, date, date, Some(existing.id), Some(unit.id))
            .await;
        self.check_same_day(&unit, date, &commitments)?;
        self.check_overlap(&unit, date, &commitments)?;

        let mut locks = UnitLocks::acquire(self, &[existing.unit_id, unit.id]).await?;
        let old_state = locks
            .get(&existing.unit_id)
            .ok_or_else(|| not_found(Entity::Unit(existing.unit_id)))?;
        let live = old_state
            .booking(existing.id)
            .filter(|b| b.status.holds_capacity())
            .cloned()
            .ok_or(Rejection::AlreadyTerminal(BookingStatus::Cancelled))?;
        // Rescheduled while we waited for the locks.
        if live.date != date {
            return Err(different_day(live.date).into());
        }
        let old_unit = UnitSnapshot::from_state(old_state);

        let target = locks
            .get(&unit.id)
            .ok_or_else(|| not_found(Entity::Unit(unit.id)))?;
        if !target.active {
            return Err(not_found(Entity::Unit(unit.id)));
        }
        if target.active_for(date, &holder, Some(live.id)).is_some() {
            return Err(Rejection::AlreadyBooked.into());
        }
        // The old row is cancelled in the same write, so it never counts against the target.
        let committed = committed_count(target, date, Some(live.id));
        let raised_to = plan_capacity(committed, target.capacity, force)?;
        let reuse = target.reusable_for(date, &holder);

        let admitted = Booking {
            id: reuse.unwrap_or_else(Ulid::new),
            unit_id: unit.id,
            holder,
            date,
            status: self.policy.admitted_status(),
            note,
            token: Some(token::generate()),
            series_id: None,
            reason: None,
        };
        let event = Event::ConflictResolved {
            cancelled_id: live.id,
            cancelled_unit: live.unit_id,
            admitted: admitted.clone(),
            raised_to,
        };
        self.persist_and_apply_pair(&mut locks, live.unit_id, unit.id, &event)
            .await?;
        let cancelled = locks
            .get(&live.unit_id)
            .and_then(|us| us.booking(live.id))
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(live.id)))?;
        drop(locks);

        debug!(
            book = self.policy.book.as_str(),
            cancelled = %cancelled.id,
            admitted = %admitted.id,
            ?raised_to,
            "conflict resolved in favour of new booking"
        );
        let resolution = Resolution::KeptNew {
            booking: admitted,
            cancelled,
            raised_to,
        };
        Ok((resolution, unit, old_unit))
    }
}
