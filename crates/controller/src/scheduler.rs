//! Automatic program scheduler: every tick, start the first program whose
//! activation time is now.
//!
//! The scheduler is a pure decision step. Everything about actually running
//! a program (record claim, zone preemption, finalization) belongs to the
//! engine; the scheduler only decides *whether* to call it.
//!
//! ## Per-program decision
//!
//! ```text
//! automatic_programs_enabled? ──no──▶ (nothing this tick)
//!        │yes
//!        ▼
//! for each program: automatic_enabled && HH:MM == activation_time
//!                   && active this month && due today
//!        │
//!        ├── a program is running ──▶ skip the rest of this tick
//!        └── otherwise ─────────────▶ execute(program, automatic), stop
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{self, Clock};
use crate::config::SettingsSource;
use crate::engine::{Engine, RunOutcome};
use crate::events::{EventKind, EventLog};
use crate::programs::ProgramStore;
use crate::record::RecordStore;

/// How often the scheduler looks for due programs.
pub const TICK_INTERVAL_SEC: u64 = 30;

#[derive(Clone)]
pub struct Scheduler {
    engine: Engine,
    programs: ProgramStore,
    record: RecordStore,
    settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    events: EventLog,
    /// `(program id, "YYYY-MM-DD HH:MM")` of the last run that claimed the
    /// record, so a run that ends early is not started again within the same
    /// minute. A refused start leaves it untouched and is retried next tick.
    last_start: Arc<Mutex<Option<(String, String)>>>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

impl Scheduler {
    pub fn new(
        engine: Engine,
        programs: ProgramStore,
        record: RecordStore,
        settings: Arc<dyn SettingsSource>,
        clock: Arc<dyn Clock>,
        events: EventLog,
    ) -> Self {
        Self {
            engine,
            programs,
            record,
            settings,
            clock,
            events,
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the scheduler loop until `shutdown` fires. Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_sec = TICK_INTERVAL_SEC, "scheduler started");
        self.events.info(EventKind::Scheduler, "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        info!("scheduler stopped");
    }

    /// Start at most one due program and wait for it to finish. Returns the
    /// id of the program that ran, `None` when nothing ran.
    pub async fn tick(&self) -> Option<String> {
        let settings = self.settings.current();
        if !settings.automatic_programs_enabled {
            return None;
        }

        let now = self.clock.now();
        let hh_mm = clock::hh_mm(now);
        let minute = format!("{} {hh_mm}", clock::yyyy_mm_dd(now));

        for program in self.programs.list() {
            if !program.automatic_enabled || program.activation_time != hh_mm {
                continue;
            }
            if !program.is_active_in_month(now.month()) || !program.is_due_on(now.date()) {
                continue;
            }

            match self.record.load() {
                Ok(record) if record.program_running => {
                    self.events.info(
                        EventKind::Scheduler,
                        format!(
                            "program {} due but program {} is running, skipping this tick",
                            program.id,
                            record.current_program_id.as_deref().unwrap_or("?")
                        ),
                    );
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.events.error(
                        EventKind::Scheduler,
                        format!("execution record unavailable, skipping this tick: {e}"),
                    );
                    return None;
                }
            }

            let key = (program.id.clone(), minute.clone());
            if self.last_start_lock().as_ref() == Some(&key) {
                continue;
            }

            self.events.info(
                EventKind::Scheduler,
                format!("starting program {} ({}) at {hh_mm}", program.id, program.name),
            );
            let id = program.id.clone();
            match self.engine.execute(program, false).await {
                RunOutcome::Completed => {}
                RunOutcome::Interrupted => {
                    self.events.warn(
                        EventKind::Scheduler,
                        format!("program {id} did not complete"),
                    );
                }
                RunOutcome::Refused => {
                    self.events.warn(
                        EventKind::Scheduler,
                        format!("program {id} was refused, retrying next tick"),
                    );
                    return None;
                }
            }
            *self.last_start_lock() = Some(key);
            return Some(id);
        }

        None
    }

    fn last_start_lock(&self) -> MutexGuard<'_, Option<(String, String)>> {
        self.last_start.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
