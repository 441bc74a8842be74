//! Program catalog: schedule model, validation, conflicts, due dates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::{Date, Month};

use crate::error::{ControlError, Result};
use crate::events::{EventKind, EventLog};
use crate::io::{self, Loaded};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub zone_id: u8,
    #[serde(alias = "duration")]
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    #[serde(alias = "giornaliero")]
    Daily,
    #[serde(alias = "giorni_alterni")]
    AlternateDay,
    #[serde(alias = "personalizzata")]
    CustomInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Month names as entered ("Giugno", "June").
    #[serde(default)]
    pub months: Vec<String>,
    /// `HH:MM`; empty means no automatic start time.
    #[serde(default)]
    pub activation_time: String,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default = "default_interval_days")]
    pub interval_days: u32,
    #[serde(default = "default_true")]
    pub automatic_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_date: Option<String>,
}

fn default_interval_days() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

const MONTH_NAMES: [(&str, &str); 12] = [
    ("gennaio", "january"),
    ("febbraio", "february"),
    ("marzo", "march"),
    ("aprile", "april"),
    ("maggio", "may"),
    ("giugno", "june"),
    ("luglio", "july"),
    ("agosto", "august"),
    ("settembre", "september"),
    ("ottobre", "october"),
    ("novembre", "november"),
    ("dicembre", "december"),
];

/// Calendar month (1-12) for an Italian or English month name.
pub fn month_number(name: &str) -> Option<u8> {
    let name = name.trim().to_lowercase();
    MONTH_NAMES
        .iter()
        .position(|(it, en)| *it == name || *en == name)
        .map(|i| i as u8 + 1)
}

impl Program {
    /// Calendar months (1-12) the program is active in; unknown names are
    /// ignored.
    pub fn month_set(&self) -> BTreeSet<u8> {
        self.months.iter().filter_map(|m| month_number(m)).collect()
    }

    pub fn is_active_in_month(&self, month: Month) -> bool {
        self.month_set().contains(&(month as u8))
    }

    /// Reject anything the scheduler or the engine could not act on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("program name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("program must have at least one step"));
        }
        if let Some(step) = self.steps.iter().find(|s| s.duration_minutes == 0) {
            return Err(invalid(format!(
                "step for zone {} must last at least one minute",
                step.zone_id
            )));
        }
        if !self.activation_time.is_empty() && parse_hh_mm(&self.activation_time).is_none() {
            return Err(invalid(format!(
                "activation time {:?} is not HH:MM",
                self.activation_time
            )));
        }
        let unknown: Vec<&str> = self
            .months
            .iter()
            .filter(|m| month_number(m).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(invalid(format!("unknown month(s): {}", unknown.join(", "))));
        }
        if self.recurrence == Recurrence::CustomInterval && self.interval_days == 0 {
            return Err(invalid("interval_days must be at least 1"));
        }
        Ok(())
    }

    /// Whether `other` would start at the same minute in a shared month.
    /// A program without months or without a time never conflicts.
    pub fn conflicts_with(&self, other: &Program) -> bool {
        if self.activation_time.is_empty() || self.activation_time != other.activation_time {
            return false;
        }
        let mine = self.month_set();
        !mine.is_empty() && !mine.is_disjoint(&other.month_set())
    }

    /// Whether the recurrence rule allows a run on `today`.
    pub fn is_due_on(&self, today: Date) -> bool {
        let Some(last) = self.last_run_date.as_deref().and_then(parse_ymd) else {
            return true;
        };
        let Some(gap) = days_between(last, (today.year(), today.month() as u8, today.day())) else {
            return true;
        };

        match self.recurrence {
            Recurrence::Daily => gap != 0,
            Recurrence::AlternateDay => gap >= 2,
            Recurrence::CustomInterval => gap >= i64::from(self.interval_days.max(1)),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ControlError {
    ControlError::InvalidInput(reason.into())
}

// ---------------------------------------------------------------------------
// Calendar arithmetic
// ---------------------------------------------------------------------------

fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn year_length(year: i32) -> i64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Day of year (1-366), `None` for a date that does not exist.
pub fn day_of_year(year: i32, month: u8, day: u8) -> Option<u16> {
    let mut days_in_month = [31u8, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if is_leap_year(year) {
        days_in_month[1] = 29;
    }
    let month_len = *days_in_month.get(usize::from(month).checked_sub(1)?)?;
    if day == 0 || day > month_len {
        return None;
    }
    let before: u16 = days_in_month[..usize::from(month) - 1]
        .iter()
        .map(|d| u16::from(*d))
        .sum();
    Some(before + u16::from(day))
}

/// Signed number of days from `from` to `to`, counting every year in
/// between; negative when `from` lies in the future.
fn days_between(from: (i32, u8, u8), to: (i32, u8, u8)) -> Option<i64> {
    let from_doy = i64::from(day_of_year(from.0, from.1, from.2)?);
    let to_doy = i64::from(day_of_year(to.0, to.1, to.2)?);

    let (lo, hi, sign) = if from.0 <= to.0 {
        (from.0, to.0, 1)
    } else {
        (to.0, from.0, -1)
    };
    let years: i64 = (lo..hi).map(year_length).sum();
    Some(to_doy - from_doy + sign * years)
}

fn parse_ymd(s: &str) -> Option<(i32, u8, u8)> {
    let mut parts = s.trim().splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    day_of_year(year, month, day)?;
    Some((year, month, day))
}

fn parse_hh_mm(s: &str) -> Option<(u8, u8)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let (h, m): (u8, u8) = (h.parse().ok()?, m.parse().ok()?);
    (h < 24 && m < 60).then_some((h, m))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type Catalog = BTreeMap<String, Program>;

/// `programs.json`: an object mapping id to program. The in-memory catalog
/// is only replaced once the new document is on disk.
#[derive(Clone)]
pub struct ProgramStore {
    path: PathBuf,
    catalog: Arc<Mutex<Catalog>>,
    events: EventLog,
}

impl ProgramStore {
    pub fn open(path: impl Into<PathBuf>, events: EventLog) -> Result<Self> {
        let path = path.into();
        let catalog = match io::read_json::<Catalog>(&path).map_err(ControlError::storage)? {
            Loaded::Valid(mut catalog) => {
                // The key is the id; a stale `id` field inside the entry is overridden.
                for (id, program) in catalog.iter_mut() {
                    if !program.id.is_empty() && program.id != *id {
                        events.warn(
                            EventKind::Program,
                            format!("program stored under {id} claims id {}, using {id}", program.id),
                        );
                    }
                    program.id = id.clone();
                }
                events.info(
                    EventKind::Program,
                    format!("loaded {} program(s) from {}", catalog.len(), path.display()),
                );
                catalog
            }
            Loaded::Missing => {
                events.info(EventKind::Program, "program catalog not found, creating empty catalog");
                let empty = Catalog::new();
                io::write_json(&path, &empty).map_err(ControlError::storage)?;
                empty
            }
            Loaded::Corrupt(reason) => {
                events.warn(
                    EventKind::Program,
                    format!("program catalog unreadable ({reason}), starting with an empty catalog"),
                );
                let empty = Catalog::new();
                io::write_json(&path, &empty).map_err(ControlError::storage)?;
                empty
            }
        };

        Ok(Self {
            path,
            catalog: Arc::new(Mutex::new(catalog)),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All programs, numeric ids in numeric order.
    pub fn list(&self) -> Vec<Program> {
        let mut programs: Vec<Program> = self.lock().values().cloned().collect();
        programs.sort_by(|a, b| {
            (a.id.parse::<u64>().ok(), &a.id).cmp(&(b.id.parse::<u64>().ok(), &b.id))
        });
        programs
    }

    pub fn get(&self, id: &str) -> Option<Program> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Add a program. An empty id gets the next free numeric id.
    pub fn create(&self, mut program: Program) -> Result<Program> {
        program.validate()?;
        let mut catalog = self.lock();

        if program.id.is_empty() {
            program.id = next_id(&catalog);
        } else if catalog.contains_key(&program.id) {
            return Err(invalid(format!("program {} already exists", program.id)));
        }
        check_conflicts(&catalog, &program, None)?;

        let mut next = catalog.clone();
        next.insert(program.id.clone(), program.clone());
        self.commit(&mut catalog, next)?;

        self.events.info(
            EventKind::Program,
            format!("program {} ({}) created", program.id, program.name),
        );
        Ok(program)
    }

    /// Replace program `id`. The stored program keeps `id` whatever the
    /// payload says.
    pub fn update(&self, id: &str, mut program: Program) -> Result<Program> {
        let mut catalog = self.lock();
        let Some(existing) = catalog.get(id) else {
            return Err(ControlError::NotFound(format!("program {id} does not exist")));
        };
        program.id = id.to_string();
        if program.last_run_date.is_none() {
            program.last_run_date = existing.last_run_date.clone();
        }
        program.validate()?;
        check_conflicts(&catalog, &program, Some(id))?;

        let mut next = catalog.clone();
        next.insert(id.to_string(), program.clone());
        self.commit(&mut catalog, next)?;

        self.events.info(
            EventKind::Program,
            format!("program {id} ({}) updated", program.name),
        );
        Ok(program)
    }

    /// Validation and conflict checks of [`update`](Self::update) without
    /// writing anything.
    pub fn check_update(&self, id: &str, program: &Program) -> Result<()> {
        let catalog = self.lock();
        if !catalog.contains_key(id) {
            return Err(ControlError::NotFound(format!("program {id} does not exist")));
        }
        program.validate()?;
        check_conflicts(&catalog, program, Some(id))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut catalog = self.lock();
        if !catalog.contains_key(id) {
            return Err(ControlError::NotFound(format!("program {id} does not exist")));
        }
        let mut next = catalog.clone();
        next.remove(id);
        self.commit(&mut catalog, next)?;

        self.events.info(EventKind::Program, format!("program {id} deleted"));
        Ok(())
    }

    /// Record a successful run. A program deleted meanwhile is ignored.
    pub fn mark_last_run(&self, id: &str, date: &str) -> Result<()> {
        let mut catalog = self.lock();
        let mut next = catalog.clone();
        let Some(program) = next.get_mut(id) else {
            tracing::debug!(program = id, "last run not recorded, program no longer exists");
            return Ok(());
        };
        program.last_run_date = Some(date.to_string());
        self.commit(&mut catalog, next)?;

        self.events.info(
            EventKind::Program,
            format!("program {id} last run date set to {date}"),
        );
        Ok(())
    }

    fn commit(&self, catalog: &mut Catalog, next: Catalog) -> Result<()> {
        io::write_json(&self.path, &next).map_err(|e| {
            self.events.error(
                EventKind::Program,
                format!("program catalog could not be saved: {e:#}"),
            );
            ControlError::storage(e)
        })?;
        *catalog = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_id(catalog: &Catalog) -> String {
    let max = catalog.keys().filter_map(|k| k.parse::<u64>().ok()).max().unwrap_or(0);
    (max + 1).to_string()
}

fn check_conflicts(catalog: &Catalog, program: &Program, exclude: Option<&str>) -> Result<()> {
    let clash = catalog
        .iter()
        .filter(|(id, _)| Some(id.as_str()) != exclude)
        .map(|(_, p)| p)
        .find(|other| program.conflicts_with(other));

    match clash {
        Some(other) => Err(ControlError::ConflictDetected(format!(
            "program '{}' already starts at {} in the selected months",
            other.name, other.activation_time
        ))),
        None => Ok(()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
