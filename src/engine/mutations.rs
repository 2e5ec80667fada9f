use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::not_found;
use super::{Engine, EngineError, Entity, Rejection, WalCommand};

pub const ELAPSED_REASON: &str = "elapsed";

fn check_name(name: &str) -> Result<(), Rejection> {
    if name.trim().is_empty() {
        return Err(Rejection::InvalidTemporal("unit name required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Rejection::LimitExceeded("unit name too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_unit(
        &self,
        id: Ulid,
        name: String,
        category: Option<String>,
        window: Window,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if self.units.len() >= MAX_UNITS_PER_BOOK {
            return Err(Rejection::LimitExceeded("too many units").into());
        }
        check_name(&name)?;
        if category.as_ref().is_some_and(|c| c.len() > MAX_NAME_LEN) {
            return Err(Rejection::LimitExceeded("category too long").into());
        }
        if window.start >= window.end {
            return Err(Rejection::InvalidTemporal("unit must end after it starts".into()).into());
        }
        let _admin = self.calendar.write().await;
        if self.units.contains_key(&id) {
            return Err(Rejection::AlreadyExists(Entity::Unit(id)).into());
        }

        let event = Event::UnitCreated {
            id,
            name: name.clone(),
            category: category.clone(),
            window,
            capacity,
        };
        self.wal_append(&event).await?;
        let us = UnitState::new(id, name, category, window, capacity);
        self.units.insert(id, Arc::new(RwLock::new(us)));
        info!(book = self.policy.book.as_str(), unit = %id, capacity, "unit created");
        Ok(())
    }

    /// Rename or (de)activate. Units are never deleted; bookings keep referencing them.
    pub async fn update_unit(
        &self,
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    ) -> Result<(), EngineError> {
        let us = self.unit_or_not_found(&id)?;
        let mut guard = us.write().await;
        let name = name.unwrap_or_else(|| guard.name.clone());
        check_name(&name)?;
        let event = Event::UnitUpdated {
            id,
            name,
            active: active.unwrap_or(guard.active),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_override(&self, id: Ulid, rule: Override) -> Result<(), EngineError> {
        if rule.reason().len() > MAX_REASON_LEN {
            return Err(Rejection::LimitExceeded("reason too long").into());
        }
        if let Override::RecurringBlock { week, .. } = &rule
            && !(1..=5).contains(week)
        {
            return Err(Rejection::InvalidTemporal(format!("week of month {week} is not 1-5")).into());
        }
        if let Some(unit_id) = rule.unit_id()
            && !self.units.contains_key(&unit_id)
        {
            return Err(not_found(Entity::Unit(unit_id)));
        }
        if self.calendar.read().await.contains(&id) {
            return Err(Rejection::AlreadyExists(Entity::Override(id)).into());
        }
        let kind = rule.kind();
        self.persist_global(&Event::OverrideAdded { id, rule }).await?;
        info!(book = self.policy.book.as_str(), %id, kind, "override added");
        Ok(())
    }

    pub async fn remove_override(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.calendar.read().await.contains(&id) {
            return Err(not_found(Entity::Override(id)));
        }
        self.persist_global(&Event::OverrideRemoved { id }).await
    }

    pub async fn grant_role(&self, holder: String, role: String) -> Result<(), EngineError> {
        if holder.len() > MAX_HOLDER_LEN || role.len() > MAX_NAME_LEN {
            return Err(Rejection::LimitExceeded("holder or role too long").into());
        }
        if self.has_role(&holder, &role) {
            return Ok(());
        }
        self.persist_global(&Event::RoleGranted { holder, role }).await
    }

    pub async fn revoke_role(&self, holder: String, role: String) -> Result<(), EngineError> {
        if !self.has_role(&holder, &role) {
            return Ok(());
        }
        self.persist_global(&Event::RoleRevoked { holder, role }).await
    }

    /// Capacity-holding bookings dated before `today`, as (unit_id, booking_id).
    pub fn collect_elapsed(&self, today: NaiveDate) -> Vec<(Ulid, Ulid)> {
        let mut elapsed = Vec::new();
        for entry in self.units.iter() {
            let us = entry.value().clone();
            let Ok(guard) = us.try_read() else { continue };
            let past = guard.bookings.partition_point(|b| b.date < today);
            for b in &guard.bookings[..past] {
                if b.status.holds_capacity() {
                    elapsed.push((guard.id, b.id));
                }
            }
        }
        elapsed
    }

    /// Move every elapsed seat to the policy's elapsed status. Returns how many moved.
    pub async fn sweep_elapsed(&self) -> Result<usize, EngineError> {
        let today = self.clock.today();
        let status = self.policy.elapsed_status;
        let mut swept = 0;
        for (unit_id, id) in self.collect_elapsed(today) {
            let Some(us) = self.get_unit(&unit_id) else { continue };
            let mut guard = us.write().await;
            // Re-check under the lock; staff may have moved it meanwhile.
            if !guard
                .booking(id)
                .is_some_and(|b| b.status.holds_capacity() && b.date < today)
            {
                continue;
            }
            let event = Event::StatusChanged {
                id,
                unit_id,
                status,
                reason: Some(ELAPSED_REASON.to_string()),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            swept += 1;
        }
        Ok(swept)
    }

    /// Rewrite the WAL as the minimal event set that reproduces current state.
    /// Every unit lock and the calendar lock stay held until the new file is in
    /// place, so no append can land in the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Calendar first: unit creation holds it, so the id list below is complete.
        let calendar = self.calendar.read().await;
        let mut ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(us) = self.get_unit(id) {
                guards.push(us.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::UnitCreated {
                id: guard.id,
                name: guard.name.clone(),
                category: guard.category.clone(),
                window: guard.window,
                capacity: guard.capacity,
            });
            if !guard.active {
                events.push(Event::UnitUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    active: false,
                });
            }
        }
        for (id, rule) in calendar.iter() {
            events.push(Event::OverrideAdded {
                id: *id,
                rule: rule.clone(),
            });
        }
        for entry in self.roles.iter() {
            for role in entry.value() {
                events.push(Event::RoleGranted {
                    holder: entry.key().clone(),
                    role: role.clone(),
                });
            }
        }
        for entry in self.series.iter() {
            events.push(Event::SeriesAdmitted {
                series: entry.value().clone(),
                bookings: vec![],
                raised_to: None,
            });
        }
        for guard in &guards {
            for booking in &guard.bookings {
                events.push(Event::BookingAdmitted {
                    booking: booking.clone(),
                    raised_to: None,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        drop(calendar);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
