use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{self, DayStatus, SlotAvailability, UnitView};
use crate::model::*;

use super::error::not_found;
use super::ledger::{committed_count, remaining};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Bookable units on `date`, net of closures and overrides. Units that have
    /// already started today are left out unless `include_past`.
    pub async fn availability(&self, date: NaiveDate, include_past: bool) -> Vec<SlotAvailability> {
        let units: Vec<_> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::with_capacity(units.len());
        for us in units {
            let guard = us.read().await;
            if !guard.active {
                continue;
            }
            views.push(UnitView {
                id: guard.id,
                name: guard.name.clone(),
                category: guard.category.clone(),
                window: guard.window,
                capacity: guard.capacity,
                booked: committed_count(&guard, date, None),
            });
        }
        let cal = self.calendar.read().await;
        calendar::resolve(date, &views, &cal, &self.catalog, self.clock.now(), include_past)
    }

    pub async fn day_status(&self, date: NaiveDate) -> DayStatus {
        self.calendar.read().await.day_status(date, &self.catalog)
    }

    /// Ceiling minus capacity-holding bookings for (unit, date).
    pub async fn remaining(&self, unit_id: Ulid, date: NaiveDate) -> Result<u32, EngineError> {
        let us = self.unit_or_not_found(&unit_id)?;
        let guard = us.read().await;
        Ok(remaining(&guard, date))
    }

    pub async fn list_units(&self) -> Vec<UnitInfo> {
        let units: Vec<_> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(units.len());
        for us in units {
            out.push(us.read().await.to_info());
        }
        out.sort_by_key(|u| (u.window.start, u.id));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let unit_id = self
            .get_unit_for_booking(&id)
            .ok_or_else(|| not_found(Entity::Booking(id)))?;
        let us = self.unit_or_not_found(&unit_id)?;
        let guard = us.read().await;
        guard
            .booking(id)
            .cloned()
            .ok_or_else(|| not_found(Entity::Booking(id)))
    }

    pub async fn booking_by_token(&self, token: &str) -> Result<Booking, EngineError> {
        let id = self
            .get_booking_for_token(token)
            .ok_or_else(|| not_found(Entity::Token))?;
        self.get_booking(id).await
    }

    /// Every row the holder has ever had, newest date first.
    pub async fn bookings_for_holder(&self, holder: &str) -> Vec<Booking> {
        let ids = self
            .index
            .holder_bookings
            .get(holder)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(b) = self.get_booking(id).await {
                out.push(b);
            }
        }
        out.sort_by(|a, b| b.date.cmp(&a.date).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn bookings_for_unit(
        &self,
        unit_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, EngineError> {
        let us = self.unit_or_not_found(&unit_id)?;
        let guard = us.read().await;
        Ok(match date {
            Some(d) => guard.on_date(d).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    pub fn get_series(&self, id: Ulid) -> Result<Series, EngineError> {
        self.series
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| not_found(Entity::Series(id)))
    }

    pub fn series_for_holder(&self, holder: &str) -> Vec<Series> {
        let mut out: Vec<Series> = self
            .series
            .iter()
            .filter(|s| s.holder == holder)
            .map(|s| s.value().clone())
            .collect();
        out.sort_by_key(|s| (s.start, s.id));
        out
    }

    pub fn roles_for(&self, holder: &str) -> Vec<String> {
        let mut roles: Vec<String> = self
            .roles
            .get(holder)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        roles.sort();
        roles
    }

    pub async fn list_overrides(&self) -> Vec<(Ulid, Override)> {
        let cal = self.calendar.read().await;
        let mut out: Vec<(Ulid, Override)> = cal.iter().map(|(id, o)| (*id, o.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
