use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use tracing::debug;
use ulid::Ulid;

use crate::calendar::{has_started, Calendar, DayStatus};
use crate::limits::*;
use crate::model::*;
use crate::policy::Eligibility;
use crate::token;

use super::error::not_found;
use super::ledger::{committed_count, plan_capacity};
use super::{ConflictDetail, Engine, EngineError, Entity, Occurrence, Rejection, UnitLocks};

pub const HOLDER_CANCEL_REASON: &str = "cancelled by holder";

/// Single-date, single-holder, single-unit admission.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub unit_id: Ulid,
    pub date: NaiveDate,
    pub holder: String,
    pub note: Option<String>,
    /// Admit past the ceiling. Honoured for staff only.
    pub force: bool,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub booking: Booking,
    /// New ceiling when a forced admission had to raise it.
    pub raised_to: Option<u32>,
    /// A cancelled or rejected row for the same key was brought back.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rescheduled {
    pub booking: Booking,
    pub previous: Occurrence,
}

/// Immutable unit attributes copied out from under a read lock.
#[derive(Debug, Clone)]
pub(super) struct UnitSnapshot {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub window: Window,
}

impl UnitSnapshot {
    pub(super) fn from_state(us: &UnitState) -> Self {
        Self {
            id: us.id,
            name: us.name.clone(),
            category: us.category.clone(),
            window: us.window,
        }
    }

    pub(super) fn occurrence(&self, booking_id: Option<Ulid>, date: NaiveDate) -> Occurrence {
        Occurrence {
            booking_id,
            unit_id: self.id,
            unit_name: self.name.clone(),
            date,
            window: self.window,
        }
    }
}

/// One of the holder's active bookings on some other unit.
#[derive(Debug, Clone)]
pub(super) struct Commitment {
    pub booking_id: Ulid,
    pub unit: UnitSnapshot,
    pub date: NaiveDate,
}

pub(super) fn check_text_limits(holder: &str, note: Option<&str>) -> Result<(), Rejection> {
    if holder.trim().is_empty() {
        return Err(Rejection::Forbidden("holder identity required"));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(Rejection::LimitExceeded("holder identity too long"));
    }
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(Rejection::LimitExceeded("note too long"));
    }
    Ok(())
}

impl Engine {
    /// Step 1: the unit exists and is active.
    pub(super) async fn unit_snapshot(&self, unit_id: &Ulid) -> Result<UnitSnapshot, EngineError> {
        let us = self.unit_or_not_found(unit_id)?;
        let guard = us.read().await;
        if !guard.active {
            return Err(not_found(Entity::Unit(*unit_id)));
        }
        Ok(UnitSnapshot::from_state(&guard))
    }

    /// Step 2: not before the organizational today, not already started, not
    /// beyond the booking horizon.
    pub(super) fn check_temporal(&self, unit: &UnitSnapshot, date: NaiveDate) -> Result<(), Rejection> {
        let now = self.clock.now();
        let today = now.date();
        if date < today {
            return Err(Rejection::InvalidTemporal(format!("{date} is in the past")));
        }
        if has_started(date, &unit.window, now) {
            return Err(Rejection::InvalidTemporal(format!(
                "{} on {date} has already started",
                unit.name
            )));
        }
        if (date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
            return Err(Rejection::InvalidTemporal(format!("{date} is too far ahead")));
        }
        Ok(())
    }

    /// Step 3: holder ↔ unit eligibility.
    pub(super) fn check_eligible(&self, holder: &str, unit: &UnitSnapshot) -> Result<(), Rejection> {
        if self.policy.eligibility == Eligibility::TrainedRole
            && let Some(role) = &unit.category
            && !self.has_role(holder, role)
        {
            return Err(Rejection::Ineligible {
                holder: holder.to_string(),
                role: role.clone(),
            });
        }
        Ok(())
    }

    pub fn has_role(&self, holder: &str, role: &str) -> bool {
        self.roles.get(holder).is_some_and(|r| r.contains(role))
    }

    /// Step 4 against an already-held calendar. Units outside the catalog's
    /// published hours are never admitted.
    pub(super) fn check_closure(
        &self,
        calendar: &Calendar,
        unit: &UnitSnapshot,
        date: NaiveDate,
    ) -> Result<(), Rejection> {
        self.check_closure_on(calendar, unit, date, calendar.holiday(date))
    }

    /// Step 4 with the date's holiday already looked up.
    pub(super) fn check_closure_on(
        &self,
        calendar: &Calendar,
        unit: &UnitSnapshot,
        date: NaiveDate,
        holiday: Option<&str>,
    ) -> Result<(), Rejection> {
        if !self.catalog.offers(&unit.window, date.weekday()) {
            return Err(Rejection::ClosedPeriod(format!(
                "{} is not offered on {}",
                unit.name,
                date.weekday()
            )));
        }
        if !self.policy.enforce_closures {
            return Ok(());
        }
        let day = DayStatus::of(date, holiday, &self.catalog);
        if !day.is_open() {
            return Err(Rejection::ClosedPeriod(day.reason()));
        }
        if let Some(exclusion) = calendar.unit_exclusion(unit.id, date) {
            return Err(Rejection::ClosedPeriod(exclusion.reason));
        }
        Ok(())
    }

    pub(super) async fn check_open(&self, unit: &UnitSnapshot, date: NaiveDate) -> Result<(), Rejection> {
        let calendar = self.calendar.read().await;
        self.check_closure(&calendar, unit, date)
    }

    /// The holder's active bookings in `[from, to]` on units other than `skip_unit`,
    /// ignoring `exclude`. Each unit is read-locked briefly, one at a time; callers
    /// must not hold any unit write lock.
    pub(super) async fn holder_commitments(
        &self,
        holder: &str,
        from: NaiveDate,
        to: NaiveDate,
        exclude: Option<Ulid>,
        skip_unit: Option<Ulid>,
    ) -> Vec<Commitment> {
        let booking_ids = self
            .index
            .holder_bookings
            .get(holder)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let unit_ids: HashSet<Ulid> = booking_ids
            .iter()
            .filter_map(|id| self.get_unit_for_booking(id))
            .filter(|u| Some(*u) != skip_unit)
            .collect();

        let mut out = Vec::new();
        for unit_id in unit_ids {
            let Some(us) = self.get_unit(&unit_id) else { continue };
            let guard = us.read().await;
            let snapshot = UnitSnapshot::from_state(&guard);
            for b in guard.in_range(from, to) {
                if b.holder == holder && b.status.is_active() && Some(b.id) != exclude {
                    out.push(Commitment {
                        booking_id: b.id,
                        unit: snapshot.clone(),
                        date: b.date,
                    });
                }
            }
        }
        out
    }

    /// Step 6: one commitment per holder per date, within the policy's scope.
    pub(super) fn check_same_day(
        &self,
        target: &UnitSnapshot,
        date: NaiveDate,
        commitments: &[Commitment],
    ) -> Result<(), Rejection> {
        let clash = commitments.iter().find(|c| {
            c.date == date
                && self
                    .policy
                    .same_day_applies(c.unit.category.as_deref(), target.category.as_deref())
        });
        match clash {
            Some(c) => Err(Rejection::SameDayConflict(Box::new(ConflictDetail {
                attempted: target.occurrence(None, date),
                existing: c.unit.occurrence(Some(c.booking_id), c.date),
            }))),
            None => Ok(()),
        }
    }

    /// Direct time overlap with any other active booking of the holder.
    pub(super) fn check_overlap(
        &self,
        target: &UnitSnapshot,
        date: NaiveDate,
        commitments: &[Commitment],
    ) -> Result<(), Rejection> {
        let clash = commitments
            .iter()
            .find(|c| c.date == date && c.unit.window.overlaps(&target.window));
        match clash {
            Some(c) => Err(Rejection::Overlapping(Box::new(ConflictDetail {
                attempted: target.occurrence(None, date),
                existing: c.unit.occurrence(Some(c.booking_id), c.date),
            }))),
            None => Ok(()),
        }
    }

    pub async fn admit(&self, req: AdmissionRequest) -> Result<Admitted, EngineError> {
        let result = self.admit_inner(&req).await;
        self.record_admission(result.as_ref().map(|(a, _)| &a.booking));
        let (admitted, unit) = result?;
        self.notify_admitted(&admitted.booking, &unit);
        Ok(admitted)
    }

    async fn admit_inner(&self, req: &AdmissionRequest) -> Result<(Admitted, UnitSnapshot), EngineError> {
        check_text_limits(&req.holder, req.note.as_deref())?;
        if !req.actor.may_act_for(&req.holder) {
            return Err(Rejection::Forbidden("holders may only book for themselves").into());
        }

        let unit = self.unit_snapshot(&req.unit_id).await?;
        self.check_temporal(&unit, req.date)?;
        self.check_eligible(&req.holder, &unit)?;
        self.check_open(&unit, req.date).await?;

        let us = self.unit_or_not_found(&unit.id)?;
        if us.read().await.active_for(req.date, &req.holder, None).is_some() {
            return Err(Rejection::AlreadyBooked.into());
        }
        let commitments = self
            .holder_commitments(&req.holder, req.date, req.date, None, Some(unit.id))
            .await;
        self.check_same_day(&unit, req.date, &commitments)?;

        // Everything above is advisory. The checks below run under the unit's
        // write lock and are the ones that hold.
        let force = req.force && req.actor.is_staff();
        let mut guard = us.write().await;
        if !guard.active {
            return Err(not_found(Entity::Unit(unit.id)));
        }
        if guard.active_for(req.date, &req.holder, None).is_some() {
            return Err(Rejection::AlreadyBooked.into());
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_UNIT {
            return Err(Rejection::LimitExceeded("too many bookings on unit").into());
        }
        let committed = committed_count(&guard, req.date, None);
        let raised_to = plan_capacity(committed, guard.capacity, force)?;
        let reuse = guard.reusable_for(req.date, &req.holder);

        let booking = Booking {
            id: reuse.unwrap_or_else(Ulid::new),
            unit_id: unit.id,
            holder: req.holder.clone(),
            date: req.date,
            status: self.policy.admitted_status(),
            note: req.note.clone(),
            token: Some(token::generate()),
            series_id: None,
            reason: None,
        };
        let event = Event::BookingAdmitted {
            booking: booking.clone(),
            raised_to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        debug!(
            book = self.policy.book.as_str(),
            booking = %booking.id,
            unit = %unit.id,
            date = %req.date,
            reused = reuse.is_some(),
            ?raised_to,
            "admitted"
        );
        let admitted = Admitted {
            booking,
            raised_to,
            reused: reuse.is_some(),
        };
        Ok((admitted, unit))
    }

    /// Move the booking behind `token` to a new (unit, date). The original row is
    /// untouched unless every check passes; on success the token is rotated.
    pub async fn reschedule(
        &self,
        token: &str,
        unit_id: Ulid,
        date: NaiveDate,
    ) -> Result<Rescheduled, EngineError> {
        let result = self.reschedule_inner(token, unit_id, date).await;
        self.record_admission(result.as_ref().map(|(r, _)| &r.booking));
        let (rescheduled, unit) = result?;
        self.notify_rescheduled(&rescheduled.booking, &rescheduled.previous, &unit);
        Ok(rescheduled)
    }

    async fn reschedule_inner(
        &self,
        token: &str,
        unit_id: Ulid,
        date: NaiveDate,
    ) -> Result<(Rescheduled, UnitSnapshot), EngineError> {
        let booking_id = self
            .get_booking_for_token(token)
            .ok_or_else(|| not_found(Entity::Token))?;
        let current = self.get_booking(booking_id).await?;

        let unit = self.unit_snapshot(&unit_id).await?;
        self.check_temporal(&unit, date)?;
        self.check_eligible(&current.holder, &unit)?;
        self.check_open(&unit, date).await?;
        let commitments = self
            .holder_commitments(&current.holder, date, date, Some(current.id), Some(unit.id))
            .await;
        self.check_same_day(&unit, date, &commitments)?;
        self.check_overlap(&unit, date, &commitments)?;

        let mut locks = UnitLocks::acquire(self, &[current.unit_id, unit.id]).await?;
        let from = locks
            .get(&current.unit_id)
            .ok_or_else(|| not_found(Entity::Unit(current.unit_id)))?;
        let live = from
            .booking(current.id)
            .filter(|b| b.token.as_deref() == Some(token) && b.status.holds_capacity())
            .cloned()
            .ok_or_else(|| not_found(Entity::Token))?;
        let previous = UnitSnapshot::from_state(from).occurrence(Some(live.id), live.date);

        let target = locks
            .get(&unit.id)
            .ok_or_else(|| not_found(Entity::Unit(unit.id)))?;
        if !target.active {
            return Err(not_found(Entity::Unit(unit.id)));
        }
        if target.active_for(date, &live.holder, Some(live.id)).is_some() {
            return Err(Rejection::AlreadyBooked.into());
        }
        let committed = committed_count(target, date, Some(live.id));
        plan_capacity(committed, target.capacity, false)?;

        let event = Event::BookingMoved {
            id: live.id,
            from_unit: live.unit_id,
            to_unit: unit.id,
            date,
            status: self.policy.admitted_status(),
            token: token::generate(),
        };
        self.persist_and_apply_pair(&mut locks, live.unit_id, unit.id, &event)
            .await?;
        let booking = locks
            .get(&unit.id)
            .and_then(|us| us.booking(live.id))
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(live.id)))?;
        drop(locks);

        debug!(
            book = self.policy.book.as_str(),
            booking = %booking.id,
            from_unit = %previous.unit_id,
            to_unit = %unit.id,
            from_date = %previous.date,
            to_date = %date,
            "rescheduled"
        );
        Ok((Rescheduled { booking, previous }, unit))
    }

    /// Staff-driven status transition.
    pub async fn update_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        if !actor.is_staff() {
            return Err(Rejection::Forbidden("only staff may change booking status").into());
        }
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let (unit_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(id)))?;
        self.check_transition(&current, status, reason.as_deref())?;

        let event = Event::StatusChanged {
            id,
            unit_id,
            status,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(id)))?;
        let unit = UnitSnapshot::from_state(&guard);
        drop(guard);

        debug!(booking = %id, from = %current.status, to = %status, "status changed");
        if !status.is_active() {
            self.notify_cancelled(&updated, &unit);
        }
        Ok(updated)
    }

    /// Guest cancellation through the emailed link. Consumes the token.
    pub async fn cancel_by_token(&self, token: &str, reason: Option<String>) -> Result<Booking, EngineError> {
        let id = self
            .get_booking_for_token(token)
            .ok_or_else(|| not_found(Entity::Token))?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| HOLDER_CANCEL_REASON.to_string());
        let (unit_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard
            .booking(id)
            .filter(|b| b.token.as_deref() == Some(token))
            .cloned()
            .ok_or_else(|| not_found(Entity::Token))?;
        self.check_transition(&current, BookingStatus::Cancelled, Some(&reason))?;

        let event = Event::StatusChanged {
            id,
            unit_id,
            status: BookingStatus::Cancelled,
            reason: Some(reason),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .booking(id)
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(id)))?;
        let unit = UnitSnapshot::from_state(&guard);
        drop(guard);

        debug!(booking = %id, "cancelled by token");
        self.notify_cancelled(&updated, &unit);
        Ok(updated)
    }

    fn check_transition(
        &self,
        current: &Booking,
        next: BookingStatus,
        reason: Option<&str>,
    ) -> Result<(), Rejection> {
        if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(Rejection::LimitExceeded("reason too long"));
        }
        if current.status.is_terminal() {
            return Err(Rejection::AlreadyTerminal(current.status));
        }
        if next == BookingStatus::Cancelled {
            if reason.is_none() {
                return Err(Rejection::ReasonRequired);
            }
            if current.date < self.clock.today() {
                return Err(Rejection::AlreadyTerminal(self.policy.elapsed_status));
            }
        }
        if !current.status.can_transition_to(next) {
            return Err(Rejection::InvalidTransition {
                from: current.status,
                to: next,
            });
        }
        Ok(())
    }

    pub(super) fn record_admission(&self, result: Result<&Booking, &EngineError>) {
        let outcome = match result {
            Ok(b) => b.status.as_str(),
            Err(EngineError::Rejected(r)) => r.code(),
            Err(EngineError::WalError(_)) => "error",
        };
        metrics::counter!(
            crate::observability::ADMISSIONS_TOTAL,
            "book" => self.policy.book.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
