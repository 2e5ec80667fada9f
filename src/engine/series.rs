use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::token;

use super::admission::{check_text_limits, Commitment, UnitSnapshot};
use super::error::not_found;
use super::ledger::plan_capacity;
use super::{Engine, EngineError, Entity, Rejection, UnitLocks};

#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub holder: String,
    pub unit_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub pattern: Pattern,
    pub force: bool,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDate {
    pub date: NaiveDate,
    pub reason: Rejection,
}

/// Partial-success outcome of a series admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesReport {
    pub series_id: Ulid,
    pub successes: Vec<NaiveDate>,
    pub skipped: Vec<SkippedDate>,
    pub bookings: Vec<Booking>,
    /// Single ceiling raise covering every forced date.
    pub raised_to: Option<u32>,
}

/// Dates in `[start, end]` matching `pattern`, ascending.
pub fn candidate_dates(start: NaiveDate, end: NaiveDate, pattern: &Pattern) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| pattern.matches(*d))
        .collect()
}

fn validate_range(start: NaiveDate, end: NaiveDate, pattern: &Pattern) -> Result<(), Rejection> {
    if end < start {
        return Err(Rejection::InvalidTemporal(format!("{end} is before {start}")));
    }
    if (end - start).num_days() + 1 > MAX_SERIES_DAYS {
        return Err(Rejection::LimitExceeded("series range too long"));
    }
    if let Pattern::Weekly(days) = pattern
        && days.is_empty()
    {
        return Err(Rejection::InvalidTemporal(
            "weekly pattern needs at least one weekday".into(),
        ));
    }
    Ok(())
}

impl Engine {
    /// Expand a series and admit every qualifying date in one write under the unit
    /// lock. Per-date problems are reported as skips; only structural problems fail.
    pub async fn admit_series(&self, req: SeriesRequest) -> Result<SeriesReport, EngineError> {
        check_text_limits(&req.holder, None)?;
        if !req.actor.may_act_for(&req.holder) {
            return Err(Rejection::Forbidden("holders may only book for themselves").into());
        }
        validate_range(req.start, req.end, &req.pattern)?;
        let unit = self.unit_snapshot(&req.unit_id).await?;
        self.check_eligible(&req.holder, &unit)?;

        let candidates = candidate_dates(req.start, req.end, &req.pattern);

        // Bulk lookups for the whole range before taking the unit lock.
        let closures: HashMap<NaiveDate, Rejection> = {
            let calendar = self.calendar.read().await;
            let holidays = calendar.holidays_between(req.start, req.end);
            candidates
                .iter()
                .filter_map(|d| {
                    let holiday = holidays.get(d).map(String::as_str);
                    self.check_closure_on(&calendar, &unit, *d, holiday)
                        .err()
                        .map(|r| (*d, r))
                })
                .collect()
        };
        let mut elsewhere: HashMap<NaiveDate, Vec<Commitment>> = HashMap::new();
        for c in self
            .holder_commitments(&req.holder, req.start, req.end, None, Some(unit.id))
            .await
        {
            elsewhere.entry(c.date).or_default().push(c);
        }

        let force = req.force && req.actor.is_staff();
        let us = self.unit_or_not_found(&unit.id)?;
        let mut guard = us.write().await;
        if !guard.active {
            return Err(not_found(Entity::Unit(unit.id)));
        }

        let mut committed: HashMap<NaiveDate, u32> = HashMap::new();
        let mut held: HashSet<NaiveDate> = HashSet::new();
        let mut reusable: HashMap<NaiveDate, Ulid> = HashMap::new();
        for b in guard.in_range(req.start, req.end) {
            if b.status.holds_capacity() {
                *committed.entry(b.date).or_default() += 1;
            }
            if b.holder == req.holder {
                if b.status.is_active() {
                    held.insert(b.date);
                } else {
                    reusable.insert(b.date, b.id);
                }
            }
        }

        let capacity = guard.capacity;
        let mut needed = capacity;
        let series_id = Ulid::new();
        let status = self.policy.admitted_status();
        let mut successes = Vec::new();
        let mut skipped = Vec::new();
        let mut bookings = Vec::new();

        for date in candidates {
            let others = elsewhere.get(&date).map(Vec::as_slice).unwrap_or(&[]);
            let verdict = self
                .check_temporal(&unit, date)
                .and_then(|()| closures.get(&date).cloned().map_or(Ok(()), Err))
                .and_then(|()| {
                    if held.contains(&date) {
                        Err(Rejection::AlreadyBooked)
                    } else {
                        Ok(())
                    }
                })
                .and_then(|()| self.check_same_day(&unit, date, others))
                .and_then(|()| self.check_overlap(&unit, date, others))
                .and_then(|()| {
                    let count = committed.get(&date).copied().unwrap_or(0);
                    plan_capacity(count, capacity, force).map(|raise| {
                        if let Some(r) = raise {
                            needed = needed.max(r);
                        }
                    })
                });
            match verdict {
                Ok(()) => {
                    successes.push(date);
                    bookings.push(Booking {
                        id: reusable.get(&date).copied().unwrap_or_else(Ulid::new),
                        unit_id: unit.id,
                        holder: req.holder.clone(),
                        date,
                        status,
                        note: None,
                        token: Some(token::generate()),
                        series_id: Some(series_id),
                        reason: None,
                    });
                }
                Err(reason) => skipped.push(SkippedDate { date, reason }),
            }
        }

        if guard.bookings.len() + bookings.len() > MAX_BOOKINGS_PER_UNIT {
            return Err(Rejection::LimitExceeded("too many bookings on unit").into());
        }
        let raised_to = (needed > capacity).then_some(needed);
        let series = Series {
            id: series_id,
            holder: req.holder.clone(),
            unit_id: unit.id,
            start: req.start,
            end: req.end,
            pattern: req.pattern.clone(),
            active: true,
        };
        let event = Event::SeriesAdmitted {
            series,
            bookings: bookings.clone(),
            raised_to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        let book = self.policy.book.as_str();
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "book" => book, "outcome" => status.as_str())
            .increment(bookings.len() as u64);
        for s in &skipped {
            metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "book" => book, "outcome" => s.reason.code())
                .increment(1);
        }
        info!(
            book,
            series = %series_id,
            unit = %unit.id,
            admitted = successes.len(),
            skipped = skipped.len(),
            ?raised_to,
            "series admitted"
        );
        for b in &bookings {
            self.notify_admitted(b, &unit);
        }

        Ok(SeriesReport {
            series_id,
            successes,
            skipped,
            bookings,
            raised_to,
        })
    }

    /// Cancel every remaining occurrence on or after `from` and close the series.
    /// Occurrences before `from`, and any before today, are left alone.
    pub async fn cancel_series(
        &self,
        id: Ulid,
        from: NaiveDate,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<Vec<Booking>, EngineError> {
        let series = self
            .series
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| not_found(Entity::Series(id)))?;
        if !actor.may_act_for(&series.holder) {
            return Err(Rejection::Forbidden("holders may only cancel their own series").into());
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .ok_or(Rejection::ReasonRequired)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(Rejection::LimitExceeded("reason too long").into());
        }
        if !series.active {
            return Err(Rejection::AlreadyTerminal(BookingStatus::Cancelled).into());
        }
        let from = from.max(self.clock.today());

        // Rescheduled occurrences keep their series id on whichever unit they
        // moved to. Lock every unit holding one of the holder's rows; retry if a
        // row moved to an unlocked unit before the locks were in place.
        let mut locks = loop {
            let mut unit_ids = self.holder_units(&series.holder);
            unit_ids.push(series.unit_id);
            let locks = UnitLocks::acquire(self, &unit_ids).await?;
            if self
                .holder_units(&series.holder)
                .iter()
                .all(|u| locks.get(u).is_some())
            {
                break locks;
            }
        };
        let cancelled: Vec<Ulid> = locks
            .iter()
            .flat_map(move |us| {
                us.bookings
                    .iter()
                    .filter(move |b| b.series_id == Some(id) && b.date >= from && b.status.holds_capacity())
                    .map(|b| b.id)
            })
            .collect();
        let event = Event::SeriesCancelled {
            id,
            unit_id: series.unit_id,
            from,
            reason,
            cancelled: cancelled.clone(),
        };
        self.persist_and_apply_locked(&mut locks, &event).await?;
        let wanted = &cancelled;
        let mut rows: Vec<(Booking, UnitSnapshot)> = locks
            .iter()
            .flat_map(move |us| {
                let unit = UnitSnapshot::from_state(us);
                us.bookings
                    .iter()
                    .filter(move |b| wanted.contains(&b.id))
                    .map(move |b| (b.clone(), unit.clone()))
            })
            .collect();
        drop(locks);
        rows.sort_by(|a, b| a.0.date.cmp(&b.0.date).then(a.0.id.cmp(&b.0.id)));

        debug!(series = %id, %from, cancelled = rows.len(), "series cancelled");
        for (b, unit) in &rows {
            self.notify_cancelled(b, unit);
        }
        Ok(rows.into_iter().map(|(b, _)| b).collect())
    }
}
