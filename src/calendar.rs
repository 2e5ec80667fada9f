//! Calendar/availability resolution: which units are bookable on a date.
//!
//! Everything here is pure. The engine snapshots unit state under read locks and
//! hands it over together with the override set and the catalog configuration.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::{Override, Window};

/// 1-based week of month, `ceil(day / 7)`. Days 1–7 are week 1, 29–31 are week 5.
/// Recurring blocks are keyed on this exact rule, not on ISO weeks.
pub fn week_of_month(date: NaiveDate) -> u32 {
    date.day().div_ceil(7)
}

/// Parse a calendar date in `YYYY-MM-DD` form.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse a wall-clock time, with or without seconds.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// An exact unit start time that is never offered on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExcludedStart {
    pub weekday: Weekday,
    pub start: NaiveTime,
}

/// Deployment configuration of a unit catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub weekend: [Weekday; 2],
    pub open_from: NaiveTime,
    pub open_until: NaiveTime,
    pub excluded_starts: Vec<ExcludedStart>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            weekend: [Weekday::Sat, Weekday::Sun],
            open_from: NaiveTime::MIN,
            open_until: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
            excluded_starts: Vec::new(),
        }
    }
}

impl Catalog {
    pub fn is_weekend(&self, date: NaiveDate) -> bool {
        self.weekend.contains(&date.weekday())
    }

    /// Whether a unit with this window is published on `weekday`.
    pub fn offers(&self, window: &Window, weekday: Weekday) -> bool {
        let hours = Window {
            start: self.open_from,
            end: self.open_until,
        };
        hours.contains_window(window)
            && !self
                .excluded_starts
                .iter()
                .any(|e| e.weekday == weekday && e.start == window.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayStatus {
    Open,
    Weekend,
    Holiday(String),
}

impl DayStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, DayStatus::Open)
    }

    /// Holidays win over weekends.
    pub fn of(date: NaiveDate, holiday: Option<&str>, catalog: &Catalog) -> Self {
        if let Some(reason) = holiday {
            return DayStatus::Holiday(reason.to_string());
        }
        if catalog.is_weekend(date) {
            return DayStatus::Weekend;
        }
        DayStatus::Open
    }

    pub fn reason(&self) -> String {
        match self {
            DayStatus::Open => String::new(),
            DayStatus::Weekend => "closed on weekends".into(),
            DayStatus::Holiday(reason) => reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Blocked,
    Break,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Blocked => "blocked",
            SlotStatus::Break => "break",
        }
    }
}

/// A unit-level exclusion in effect on some date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub status: SlotStatus,
    pub reason: String,
}

/// Staff-authored overrides, keyed by override id.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    overrides: HashMap<Ulid, Override>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Ulid, rule: Override) {
        self.overrides.insert(id, rule);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Override> {
        self.overrides.remove(id)
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.overrides.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ulid, &Override)> {
        self.overrides.iter()
    }

    pub fn holiday(&self, date: NaiveDate) -> Option<&str> {
        self.overrides.values().find_map(|o| match o {
            Override::Holiday { date: d, reason } if *d == date => Some(reason.as_str()),
            _ => None,
        })
    }

    /// Holidays falling in `[from, to]`, with their reasons.
    pub fn holidays_between(&self, from: NaiveDate, to: NaiveDate) -> HashMap<NaiveDate, String> {
        self.overrides
            .values()
            .filter_map(|o| match o {
                Override::Holiday { date, reason } if *date >= from && *date <= to => {
                    Some((*date, reason.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn day_status(&self, date: NaiveDate, catalog: &Catalog) -> DayStatus {
        DayStatus::of(date, self.holiday(date), catalog)
    }

    /// One-off and recurring blocks merge into `blocked`, the one-off reason winning;
    /// `blocked` always beats `break`.
    pub fn unit_exclusion(&self, unit_id: Ulid, date: NaiveDate) -> Option<Exclusion> {
        let weekday = date.weekday();
        let week = week_of_month(date);
        let mut one_off = None;
        let mut recurring = None;
        let mut brk = None;
        for rule in self.overrides.values() {
            match rule {
                Override::Block { unit_id: u, date: d, reason } if *u == unit_id && *d == date => {
                    one_off = Some(reason);
                }
                Override::RecurringBlock { unit_id: u, weekday: wd, week: w, reason }
                    if *u == unit_id && *wd == weekday && *w == week =>
                {
                    recurring = Some(reason);
                }
                Override::Break { unit_id: u, weekday: wd, reason } if *u == unit_id && *wd == weekday => {
                    brk = Some(reason);
                }
                _ => {}
            }
        }
        if let Some(reason) = one_off.or(recurring) {
            return Some(Exclusion {
                status: SlotStatus::Blocked,
                reason: reason.clone(),
            });
        }
        brk.map(|reason| Exclusion {
            status: SlotStatus::Break,
            reason: reason.clone(),
        })
    }
}

/// Whether a unit on `date` has already started at `now`.
pub fn has_started(date: NaiveDate, window: &Window, now: NaiveDateTime) -> bool {
    date < now.date() || (date == now.date() && window.start <= now.time())
}

/// Unit state as the resolver needs it.
#[derive(Debug, Clone)]
pub struct UnitView {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub window: Window,
    pub capacity: u32,
    pub booked: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub unit_id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub window: Window,
    pub capacity: u32,
    pub booked: u32,
    /// Effective remaining seats; zero when excluded.
    pub available: u32,
    pub status: Option<SlotStatus>,
    pub reason: Option<String>,
}

/// Resolve the bookable units for `date`. Closed days yield nothing.
pub fn resolve(
    date: NaiveDate,
    units: &[UnitView],
    calendar: &Calendar,
    catalog: &Catalog,
    now: NaiveDateTime,
    include_past: bool,
) -> Vec<SlotAvailability> {
    if !calendar.day_status(date, catalog).is_open() {
        return Vec::new();
    }
    let weekday = date.weekday();
    let mut slots: Vec<SlotAvailability> = units
        .iter()
        .filter(|u| catalog.offers(&u.window, weekday))
        .filter(|u| include_past || !has_started(date, &u.window, now))
        .map(|u| {
            let exclusion = calendar.unit_exclusion(u.id, date);
            let available = if exclusion.is_some() {
                0
            } else {
                u.capacity.saturating_sub(u.booked)
            };
            SlotAvailability {
                unit_id: u.id,
                name: u.name.clone(),
                category: u.category.clone(),
                window: u.window,
                capacity: u.capacity,
                booked: u.booked,
                available,
                status: exclusion.as_ref().map(|e| e.status),
                reason: exclusion.map(|e| e.reason),
            }
        })
        .collect();
    slots.sort_by_key(|s| (s.window.start, s.window.end));
    slots
}
