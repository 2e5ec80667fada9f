mod admission;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod notices;
mod queries;
mod series;
#[cfg(test)]
mod tests;

pub use admission::{AdmissionRequest, Admitted, Rescheduled};
pub use conflict::{Keep, Resolution, ResolveRequest};
pub use error::{ConflictDetail, EngineError, Entity, Occurrence, Rejection};
pub use ledger::plan_capacity;
pub use series::{SeriesReport, SeriesRequest, SkippedDate};

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::calendar::{Calendar, Catalog};
use crate::clock::Clock;
use crate::model::*;
use crate::notify::Dispatcher;
use crate::policy::BookingPolicy;
use crate::wal::Wal;

use error::not_found;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Secondary lookups over booking rows. Kept in step with unit state by `apply_to_unit`.
#[derive(Default)]
pub(super) struct Indexes {
    /// booking id → unit id
    pub(super) booking_unit: DashMap<Ulid, Ulid>,
    /// live guest token → booking id
    pub(super) tokens: DashMap<String, Ulid>,
    /// holder → booking ids, every status
    pub(super) holder_bookings: DashMap<String, Vec<Ulid>>,
}

impl Indexes {
    fn track(&self, booking: &Booking) {
        self.booking_unit.insert(booking.id, booking.unit_id);
        let mut ids = self.holder_bookings.entry(booking.holder.clone()).or_default();
        if !ids.contains(&booking.id) {
            ids.push(booking.id);
        }
        drop(ids);
        if let Some(token) = &booking.token {
            self.tokens.insert(token.clone(), booking.id);
        }
    }

    fn forget_token(&self, token: &Option<String>) {
        if let Some(t) = token {
            self.tokens.remove(t);
        }
    }
}

/// Everything the engine needs besides its WAL path.
pub struct EngineOptions {
    pub policy: BookingPolicy,
    pub catalog: Catalog,
    /// Base for cancel/reschedule links in notifications.
    pub public_url: String,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

/// One booking book of one organization: units, their booking rows, overrides,
/// roles and series. Each unit's lock doubles as the lock on its capacity row.
pub struct Engine {
    pub units: DashMap<Ulid, SharedUnitState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) index: Indexes,
    pub(super) calendar: RwLock<Calendar>,
    pub(super) roles: DashMap<String, HashSet<String>>,
    pub(super) series: DashMap<Ulid, Series>,
    pub(super) policy: BookingPolicy,
    pub(super) catalog: Catalog,
    pub(super) public_url: String,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) dispatcher: Arc<dyn Dispatcher>,
}

/// Apply a unit-scoped event directly to a UnitState (caller holds the lock).
fn apply_to_unit(us: &mut UnitState, event: &Event, index: &Indexes) {
    match event {
        Event::UnitUpdated { name, active, .. } => {
            us.name = name.clone();
            us.active = *active;
        }
        Event::BookingAdmitted { booking, raised_to } => {
            if let Some(cap) = raised_to {
                us.capacity = us.capacity.max(*cap);
            }
            if let Some(old) = us.booking(booking.id) {
                index.forget_token(&old.token);
            }
            index.track(booking);
            us.upsert_booking(booking.clone());
        }
        Event::StatusChanged { id, status, reason, .. } => {
            if let Some(b) = us.booking_mut(*id) {
                b.status = *status;
                b.reason = reason.clone();
                if !status.holds_capacity() {
                    index.forget_token(&b.token);
                    b.token = None;
                }
            }
        }
        Event::SeriesAdmitted { bookings, raised_to, .. } => {
            if let Some(cap) = raised_to {
                us.capacity = us.capacity.max(*cap);
            }
            for booking in bookings {
                if let Some(old) = us.booking(booking.id) {
                    index.forget_token(&old.token);
                }
                index.track(booking);
                us.upsert_booking(booking.clone());
            }
        }
        Event::SeriesCancelled { reason, cancelled, .. } => {
            for id in cancelled {
                if let Some(b) = us.booking_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                    b.reason = Some(reason.clone());
                    index.forget_token(&b.token);
                    b.token = None;
                }
            }
        }
        // Two-unit events go through `apply_move` / `apply_conflict`; the rest
        // are engine-level.
        Event::BookingMoved { .. }
        | Event::ConflictResolved { .. }
        | Event::UnitCreated { .. }
        | Event::OverrideAdded { .. }
        | Event::OverrideRemoved { .. }
        | Event::RoleGranted { .. }
        | Event::RoleRevoked { .. } => {}
    }
}

/// Move a row between units (or within one when `to` is `None`).
fn apply_move(from: &mut UnitState, to: Option<&mut UnitState>, event: &Event, index: &Indexes) {
    let Event::BookingMoved { id, to_unit, date, status, token, .. } = event else {
        return;
    };
    let Some(mut booking) = from.remove_booking(*id) else {
        return;
    };
    index.forget_token(&booking.token);
    booking.unit_id = *to_unit;
    booking.date = *date;
    booking.status = *status;
    booking.token = Some(token.clone());
    booking.reason = None;
    index.track(&booking);
    match to {
        Some(target) => target.upsert_booking(booking),
        None => from.upsert_booking(booking),
    }
}

/// Cancel the losing row and admit the winner (same unit when `to` is `None`).
fn apply_conflict(from: &mut UnitState, to: Option<&mut UnitState>, event: &Event, index: &Indexes) {
    let Event::ConflictResolved { cancelled_id, admitted, raised_to, .. } = event else {
        return;
    };
    if let Some(b) = from.booking_mut(*cancelled_id) {
        b.status = BookingStatus::Cancelled;
        b.reason = Some(CONFLICT_REASON.to_string());
        index.forget_token(&b.token);
        b.token = None;
    }
    let target = match to {
        Some(t) => t,
        None => from,
    };
    if let Some(cap) = raised_to {
        target.capacity = target.capacity.max(*cap);
    }
    if let Some(old) = target.booking(admitted.id) {
        index.forget_token(&old.token);
    }
    index.track(admitted);
    target.upsert_booking(admitted.clone());
}

pub const CONFLICT_REASON: &str = "conflict";

impl Engine {
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            units: DashMap::new(),
            wal_tx,
            index: Indexes::default(),
            calendar: RwLock::new(Calendar::new()),
            roles: DashMap::new(),
            series: DashMap::new(),
            policy: options.policy,
            catalog: options.catalog,
            public_url: options.public_url,
            clock: options.clock,
            dispatcher: options.dispatcher,
        };

        // Replay events. We are the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::UnitCreated { id, name, category, window, capacity } => {
                let us = UnitState::new(*id, name.clone(), category.clone(), *window, *capacity);
                self.units.insert(*id, Arc::new(RwLock::new(us)));
            }
            Event::SeriesCancelled { unit_id, cancelled, .. } => {
                let mut unit_ids: Vec<Ulid> = cancelled
                    .iter()
                    .filter_map(|id| self.get_unit_for_booking(id))
                    .collect();
                unit_ids.push(*unit_id);
                unit_ids.sort();
                unit_ids.dedup();
                for uid in &unit_ids {
                    if let Some(us) = self.get_unit(uid) {
                        let mut guard = us.try_write().expect("replay: uncontended write");
                        apply_to_unit(&mut guard, event, &self.index);
                    }
                }
                self.apply_series_row(event);
            }
            Event::BookingMoved { from_unit, to_unit, .. }
            | Event::ConflictResolved { cancelled_unit: from_unit, admitted: Booking { unit_id: to_unit, .. }, .. } => {
                let Some(from) = self.get_unit(from_unit) else { return };
                let mut from_guard = from.try_write().expect("replay: uncontended write");
                let apply = if matches!(event, Event::BookingMoved { .. }) { apply_move } else { apply_conflict };
                if from_unit == to_unit {
                    apply(&mut from_guard, None, event, &self.index);
                } else if let Some(to) = self.get_unit(to_unit) {
                    let mut to_guard = to.try_write().expect("replay: uncontended write");
                    apply(&mut from_guard, Some(&mut to_guard), event, &self.index);
                }
            }
            other => {
                if let Some(unit_id) = event_unit_id(other) {
                    if let Some(us) = self.get_unit(&unit_id) {
                        let mut guard = us.try_write().expect("replay: uncontended write");
                        apply_to_unit(&mut guard, other, &self.index);
                    }
                    self.apply_series_row(other);
                } else {
                    self.apply_global(other);
                }
            }
        }
    }

    /// Apply an event that is not scoped to a unit's booking rows.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::OverrideAdded { id, rule } => {
                if let Ok(mut cal) = self.calendar.try_write() {
                    cal.insert(*id, rule.clone());
                }
            }
            Event::OverrideRemoved { id } => {
                if let Ok(mut cal) = self.calendar.try_write() {
                    cal.remove(id);
                }
            }
            Event::RoleGranted { holder, role } => {
                self.roles.entry(holder.clone()).or_default().insert(role.clone());
            }
            Event::RoleRevoked { holder, role } => {
                if let Some(mut roles) = self.roles.get_mut(holder) {
                    roles.remove(role);
                }
            }
            _ => {}
        }
        self.apply_series_row(event);
    }

    /// Series rows live outside unit state; keep them in step with the unit events.
    fn apply_series_row(&self, event: &Event) {
        match event {
            Event::SeriesAdmitted { series, .. } => {
                self.series.insert(series.id, series.clone());
            }
            Event::SeriesCancelled { id, from, .. } => {
                if let Some(mut s) = self.series.get_mut(id) {
                    s.active = false;
                    s.end = s.end.min(*from);
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub(super) fn unit_or_not_found(&self, id: &Ulid) -> Result<SharedUnitState, EngineError> {
        self.get_unit(id).ok_or_else(|| not_found(Entity::Unit(*id)))
    }

    pub fn get_unit_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.booking_unit.get(booking_id).map(|e| *e.value())
    }

    pub fn get_booking_for_token(&self, token: &str) -> Option<Ulid> {
        self.index.tokens.get(token).map(|e| *e.value())
    }

    /// WAL-append + apply in one call for events touching one unit.
    pub(super) async fn persist_and_apply(
        &self,
        us: &mut UnitState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_unit(us, event, &self.index);
        self.apply_series_row(event);
        Ok(())
    }

    /// WAL-append + apply for a row move or conflict swap across the locked units.
    pub(super) async fn persist_and_apply_pair(
        &self,
        locks: &mut UnitLocks,
        from: Ulid,
        to: Ulid,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let apply = if matches!(event, Event::BookingMoved { .. }) { apply_move } else { apply_conflict };
        if from == to {
            if let Some(us) = locks.get_mut(&from) {
                apply(us, None, event, &self.index);
            }
        } else if let Some((a, b)) = locks.pair_mut(&from, &to) {
            apply(a, Some(b), event, &self.index);
        }
        Ok(())
    }

    /// WAL-append + apply for an event whose rows may sit on any of the locked units.
    pub(super) async fn persist_and_apply_locked(
        &self,
        locks: &mut UnitLocks,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for us in locks.iter_mut() {
            apply_to_unit(us, event, &self.index);
        }
        self.apply_series_row(event);
        Ok(())
    }

    /// Units currently holding any of the holder's rows.
    pub(super) fn holder_units(&self, holder: &str) -> Vec<Ulid> {
        let Some(ids) = self.index.holder_bookings.get(holder) else {
            return Vec::new();
        };
        let mut units: Vec<Ulid> = ids.iter().filter_map(|id| self.get_unit_for_booking(id)).collect();
        units.sort();
        units.dedup();
        units
    }

    /// WAL-append + apply for override and role changes, under the calendar lock.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        self.wal_append(event).await?;
        match event {
            Event::OverrideAdded { id, rule } => cal.insert(*id, rule.clone()),
            Event::OverrideRemoved { id } => {
                cal.remove(id);
            }
            other => self.apply_global(other),
        }
        Ok(())
    }

    /// Lookup booking → unit, get unit, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<UnitState>), EngineError> {
        let unit_id = self
            .get_unit_for_booking(booking_id)
            .ok_or_else(|| not_found(Entity::Booking(*booking_id)))?;
        let us = self.unit_or_not_found(&unit_id)?;
        let guard = us.write_owned().await;
        Ok((unit_id, guard))
    }
}

/// Write locks over a set of units, always acquired in id order to prevent deadlocks.
pub(super) struct UnitLocks {
    guards: Vec<OwnedRwLockWriteGuard<UnitState>>,
}

impl UnitLocks {
    pub(super) async fn acquire(engine: &Engine, ids: &[Ulid]) -> Result<Self, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let us = engine.unit_or_not_found(id)?;
            guards.push(us.write_owned().await);
        }
        Ok(Self { guards })
    }

    pub(super) fn get(&self, id: &Ulid) -> Option<&UnitState> {
        self.guards.iter().map(|g| &**g).find(|us| us.id == *id)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut UnitState> {
        self.guards.iter_mut().map(|g| &mut **g).find(|us| us.id == *id)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &UnitState> {
        self.guards.iter().map(|g| &**g)
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = &mut UnitState> {
        self.guards.iter_mut().map(|g| &mut **g)
    }

    /// Two distinct locked units, mutably.
    pub(super) fn pair_mut(&mut self, a: &Ulid, b: &Ulid) -> Option<(&mut UnitState, &mut UnitState)> {
        let ia = self.guards.iter().position(|g| g.id == *a)?;
        let ib = self.guards.iter().position(|g| g.id == *b)?;
        if ia == ib {
            return None;
        }
        let (lo, hi) = (ia.min(ib), ia.max(ib));
        let (left, right) = self.guards.split_at_mut(hi);
        let (first, second) = (&mut *left[lo], &mut *right[0]);
        if ia < ib {
            Some((first, second))
        } else {
            Some((second, first))
        }
    }
}

/// Extract the unit id from a single-unit event. `None` for engine-level and multi-unit events.
fn event_unit_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::UnitUpdated { id, .. } => Some(*id),
        Event::BookingAdmitted { booking, .. } => Some(booking.unit_id),
        Event::StatusChanged { unit_id, .. } => Some(*unit_id),
        Event::SeriesAdmitted { series, .. } => Some(series.unit_id),
        Event::UnitCreated { .. }
        | Event::BookingMoved { .. }
        | Event::ConflictResolved { .. }
        | Event::SeriesCancelled { .. }
        | Event::OverrideAdded { .. }
        | Event::OverrideRemoved { .. }
        | Event::RoleGranted { .. }
        | Event::RoleRevoked { .. } => None,
    }
}
