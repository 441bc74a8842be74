//! Program execution: one cancellable run at a time, gated by the persisted
//! execution record.
//!
//! A run claims the record, then walks its steps in a spawned task. A step
//! waits for the deadline of the zone it opened, and every wait races the
//! run's cancellation token, so [`Engine::stop`] takes effect at once.
//! However the run ends (completion, stop, panic in the step loop, or the
//! caller dropping the future) it is finalized exactly once: a run that
//! still owns the record forces every zone off and clears the record, a run
//! stopped from outside only closes the zone it still holds.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, Clock};
use crate::config::SettingsSource;
use crate::events::{EventKind, EventLog};
use crate::programs::{Program, ProgramStore};
use crate::record::{ExecutionRecord, RecordStore};
use crate::zones::{ZoneActuator, ZoneLease};

/// What the running program is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    /// Claiming the record and clearing zones.
    Preparing,
    Watering { zone_id: u8 },
    /// Pause between two steps; no zone is open.
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped,
    /// Stopped, but the record or some output could not be reset cleanly.
    StoppedWithErrors,
}

/// How a call to [`Engine::execute`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The record was not claimed; nothing ran.
    Refused,
    /// Stopped or failed before the last step finished.
    Interrupted,
    Completed,
}

struct Current {
    phase: RunPhase,
    cancel: Option<CancellationToken>,
    /// Zone the step loop currently holds open.
    open: Option<ZoneLease>,
}

struct EngineInner {
    zones: ZoneActuator,
    record: RecordStore,
    programs: ProgramStore,
    settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    events: EventLog,
    /// Held for a whole run, finalization included.
    run_lock: tokio::sync::Mutex<()>,
    current: Mutex<Current>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        zones: ZoneActuator,
        record: RecordStore,
        programs: ProgramStore,
        settings: Arc<dyn SettingsSource>,
        clock: Arc<dyn Clock>,
        events: EventLog,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                zones,
                record,
                programs,
                settings,
                clock,
                events,
                run_lock: tokio::sync::Mutex::new(()),
                current: Mutex::new(Current {
                    phase: RunPhase::Idle,
                    cancel: None,
                    open: None,
                }),
            }),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.current().phase
    }

    pub fn is_running(&self) -> bool {
        self.inner.record.is_running()
    }

    /// Run `program` to completion.
    pub async fn execute(&self, program: Program, manual: bool) -> RunOutcome {
        let inner = &self.inner;
        let id = program.id.clone();

        match inner.record.load() {
            Ok(record) if record.program_running => {
                inner.events.warn(
                    EventKind::Program,
                    format!(
                        "program {id} not started, program {} is already running",
                        record.current_program_id.as_deref().unwrap_or("?")
                    ),
                );
                return RunOutcome::Refused;
            }
            Ok(_) => {}
            Err(e) => {
                inner.events.error(
                    EventKind::Program,
                    format!("program {id} not started, execution record unavailable: {e}"),
                );
                return RunOutcome::Refused;
            }
        }

        // A stopped run still finalizing must finish before this one begins.
        let _run = inner.run_lock.lock().await;
        if inner.record.is_running() {
            inner.events.warn(
                EventKind::Program,
                format!("program {id} not started, another run claimed the record"),
            );
            return RunOutcome::Refused;
        }

        let cancel = CancellationToken::new();
        {
            let mut current = inner.current();
            current.phase = RunPhase::Preparing;
            current.cancel = Some(cancel.clone());
        }

        if !manual && inner.zones.active_count() > 0 {
            inner.events.info(
                EventKind::Program,
                format!("automatic program {id} preempts manual zones"),
            );
            if let Err(e) = inner.zones.deactivate_all() {
                inner.events.warn(EventKind::Program, format!("stopping manual zones: {e}"));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Err(e) = inner.zones.deactivate_all() {
            inner.events.error(
                EventKind::Program,
                format!("program {id} not started, zones could not be reset: {e}"),
            );
            inner.reset_current();
            return RunOutcome::Refused;
        }

        match inner.record.try_begin(&id) {
            Ok(true) => {}
            Ok(false) => {
                inner.events.warn(
                    EventKind::Program,
                    format!("program {id} not started, record already claimed"),
                );
                inner.reset_current();
                return RunOutcome::Refused;
            }
            Err(e) => {
                inner.events.error(
                    EventKind::Program,
                    format!("program {id} not started, record could not be saved: {e}"),
                );
                // The in-memory record may already say "running".
                let _finalize = Finalizer::new(inner.clone(), id, cancel);
                return RunOutcome::Refused;
            }
        }

        let kind = if manual { "manual" } else { "automatic" };
        inner.events.info(
            EventKind::Program,
            format!("{kind} program {id} ({}) started, {} step(s)", program.name, program.steps.len()),
        );

        let finalize = Finalizer::new(inner.clone(), id.clone(), cancel.clone());

        let worker = tokio::spawn(run_steps(inner.clone(), program, cancel));
        let completed = match worker.await {
            Ok(completed) => completed,
            Err(e) => {
                inner.events.error(
                    EventKind::Program,
                    format!("program {id} step loop aborted: {e}"),
                );
                false
            }
        };

        let outcome = if completed {
            let today = clock::yyyy_mm_dd(inner.clock.now());
            if let Err(e) = inner.programs.mark_last_run(&id, &today) {
                inner.events.error(
                    EventKind::Program,
                    format!("program {id} completed but last run date not saved: {e}"),
                );
            }
            inner.events.info(EventKind::Program, format!("program {id} completed"));
            RunOutcome::Completed
        } else {
            inner.events.info(
                EventKind::Program,
                format!("program {id} ended before completion"),
            );
            RunOutcome::Interrupted
        };

        drop(finalize);
        outcome
    }

    /// Stop whatever program the record says is running.
    pub fn stop(&self) -> StopOutcome {
        let inner = &self.inner;
        let record = match inner.record.load() {
            Ok(record) => record,
            Err(e) => {
                inner.events.warn(
                    EventKind::Program,
                    format!("stop: execution record unreadable, using memory: {e}"),
                );
                inner.record.snapshot()
            }
        };
        if !record.program_running {
            return StopOutcome::NotRunning;
        }

        let id = record.current_program_id.unwrap_or_default();
        inner.events.info(EventKind::Program, format!("stopping program {id}"));

        let mut clean = true;
        if let Err(e) = inner.record.clear() {
            inner.events.error(EventKind::Program, format!("stop: {e}"));
            clean = false;
        }
        if let Some(cancel) = &inner.current().cancel {
            cancel.cancel();
        }
        if let Err(e) = inner.zones.deactivate_all() {
            inner.events.error(EventKind::Program, format!("stop: {e}"));
            clean = false;
        }

        if clean {
            StopOutcome::Stopped
        } else {
            StopOutcome::StoppedWithErrors
        }
    }
}

impl EngineInner {
    fn current(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: RunPhase) {
        self.current().phase = phase;
    }

    fn reset_current(&self) {
        let mut current = self.current();
        current.phase = RunPhase::Idle;
        current.cancel = None;
        current.open = None;
    }
}

async fn run_steps(inner: Arc<EngineInner>, program: Program, cancel: CancellationToken) -> bool {
    let total = program.steps.len();

    for (index, step) in program.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return false;
        }

        inner.set_phase(RunPhase::Watering {
            zone_id: step.zone_id,
        });
        let lease = match inner
            .zones
            .activate_for_program(step.zone_id, step.duration_minutes)
        {
            Ok(lease) => lease,
            Err(e) => {
                inner.events.error(
                    EventKind::Program,
                    format!(
                        "program {}: step {}/{total} on zone {} skipped: {e}",
                        program.id,
                        index + 1,
                        step.zone_id
                    ),
                );
                continue;
            }
        };
        inner.current().open = Some(lease);

        // Same deadline as the zone's own auto-off timer.
        if !wait_until(&cancel, lease.deadline).await {
            return false;
        }

        if let Err(e) = inner.zones.deactivate_lease(&lease) {
            inner.events.warn(
                EventKind::Program,
                format!("program {}: closing zone {}: {e}", program.id, step.zone_id),
            );
        }
        inner.current().open = None;

        if index + 1 < total {
            let delay = inner.settings.current().activation_delay;
            inner.set_phase(RunPhase::Delay);
            let until = Instant::now() + Duration::from_secs(u64::from(delay) * 60);
            if !wait_until(&cancel, until).await {
                return false;
            }
        }
    }

    !cancel.is_cancelled()
}

/// Sleep until `deadline`. `false` if the run was stopped first.
async fn wait_until(cancel: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => !cancel.is_cancelled(),
    }
}

/// Finalizes the run when dropped.
struct Finalizer {
    inner: Arc<EngineInner>,
    program_id: String,
    cancel: CancellationToken,
}

impl Finalizer {
    fn new(inner: Arc<EngineInner>, program_id: String, cancel: CancellationToken) -> Self {
        Self {
            inner,
            program_id,
            cancel,
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        // Stops an orphaned step loop if the caller went away mid-run.
        self.cancel.cancel();

        let inner = &self.inner;
        let lease = inner.current().open.take();

        if inner.record.snapshot() == ExecutionRecord::running(self.program_id.as_str()) {
            // Zones first: manual activation is refused until the record clears.
            if let Err(e) = inner.zones.deactivate_all() {
                inner.events.error(
                    EventKind::Program,
                    format!("program {}: zones not fully reset: {e}", self.program_id),
                );
            }
            if let Err(e) = inner.record.clear() {
                inner.events.error(
                    EventKind::Program,
                    format!("program {}: execution record not cleared: {e}", self.program_id),
                );
            }
        } else if let Some(lease) = lease {
            // Stopped from outside: `stop` already reset the zones, and any
            // zone opened manually since then is left alone.
            if let Err(e) = inner.zones.deactivate_lease(&lease) {
                inner.events.error(
                    EventKind::Program,
                    format!(
                        "program {}: zone {} not closed: {e}",
                        self.program_id, lease.zone_id
                    ),
                );
            }
        }
        inner.reset_current();
        tracing::debug!(program = %self.program_id, "run finalized");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Rig;
    use crate::valve::Channel;
    use tokio::time::{sleep, timeout, Instant};

    #[tokio::test(start_paused = true)]
    async fn program_runs_all_steps_and_records_last_run() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 1), (1, 1)]);

        let started = Instant::now();
        assert_eq!(rig.engine.execute(p.clone(), true).await, RunOutcome::Completed);

        // Two one-minute steps plus one one-minute delay.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(180) && elapsed < Duration::from_secs(181));
        assert_eq!(
            rig.programs.get(&p.id).unwrap().last_run_date.as_deref(),
            Some("2024-06-15")
        );
        assert!(!rig.record.is_running());
        assert_eq!(rig.zones.active_count(), 0);
        assert!(!rig.zones.relay_engaged());
        assert_eq!(rig.engine.phase(), RunPhase::Idle);

        let opened: Vec<Channel> = rig
            .board
            .writes()
            .into_iter()
            .filter(|(c, open)| *open && matches!(c, Channel::Zone(_)))
            .map(|(c, _)| c)
            .collect();
        assert_eq!(opened, vec![Channel::Zone(0), Channel::Zone(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn phases_follow_the_steps() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(2, 1), (3, 1)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(30)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Watering { zone_id: 2 });
        assert!(rig.zones.is_active(2));
        assert!(rig.record.is_running());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Delay);
        assert_eq!(rig.zones.active_count(), 0);
        assert!(!rig.zones.relay_engaged());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Watering { zone_id: 3 });

        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_while_record_is_running() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 1)]);
        rig.record.try_begin("other").unwrap();

        assert_eq!(rig.engine.execute(p.clone(), true).await, RunOutcome::Refused);
        assert!(rig.board.writes().is_empty());
        assert_eq!(rig.record.current_program_id().as_deref(), Some("other"));
        assert!(rig.programs.get(&p.id).unwrap().last_run_date.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_program_runs_at_a_time() {
        let rig = Rig::new();
        let a = rig.add_program("A", &[(0, 2)]);
        let b = rig
            .programs
            .create(crate::testkit::program("B", &[(1, 1)], "07:00"))
            .unwrap();

        let engine = rig.engine.clone();
        let first = tokio::spawn(async move { engine.execute(a, true).await });
        sleep(Duration::from_secs(5)).await;

        assert_eq!(rig.engine.execute(b, true).await, RunOutcome::Refused);
        assert!(!rig.zones.is_active(1));
        assert_eq!(first.await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_run_within_a_second() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 10), (1, 10)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(30)).await;
        assert!(rig.zones.is_active(0));

        assert_eq!(rig.engine.stop(), StopOutcome::Stopped);
        assert!(!rig.record.is_running());
        assert_eq!(rig.zones.active_count(), 0);

        let completed = timeout(Duration::from_millis(1500), run)
            .await
            .expect("run did not observe stop")
            .unwrap();
        assert_eq!(completed, RunOutcome::Interrupted);
        assert!(!rig.zones.is_active(1));
        assert_eq!(rig.engine.phase(), RunPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_run_keeps_last_run_date() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 5)]);
        let engine = rig.engine.clone();
        let id = p.id.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(10)).await;
        rig.engine.stop();
        assert_eq!(run.await.unwrap(), RunOutcome::Interrupted);
        assert!(rig.programs.get(&id).unwrap().last_run_date.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_zone_opened_after_stop_survives_finalization() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 10)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.engine.stop(), StopOutcome::Stopped);
        rig.zones.activate(3, 5).unwrap();

        assert_eq!(run.await.unwrap(), RunOutcome::Interrupted);
        assert!(rig.zones.is_active(3));
        assert!(!rig.zones.is_active(0));
        assert!(rig.zones.relay_engaged());
    }

    #[tokio::test(start_paused = true)]
    async fn step_ends_on_the_zone_deadline() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 30)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(30 * 60 - 1)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Watering { zone_id: 0 });
        assert!(rig.zones.is_active(0));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Idle);
        assert!(!rig.record.is_running());
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn stop_without_program_is_not_running() {
        let rig = Rig::new();
        assert_eq!(rig.engine.stop(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn stop_clears_a_record_without_live_run() {
        let rig = Rig::new();
        rig.record.try_begin("ghost").unwrap();
        assert_eq!(rig.engine.stop(), StopOutcome::Stopped);
        assert!(!rig.record.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_run_preempts_manual_zones() {
        let rig = Rig::new();
        rig.zones.activate(5, 30).unwrap();
        let p = rig.add_program("Orto", &[(0, 1)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, false).await });

        sleep(Duration::from_secs(10)).await;
        assert!(!rig.zones.is_active(5));
        assert!(rig.zones.is_active(0));
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_is_skipped_without_delay() {
        let rig = Rig::new();
        rig.board.set_failing(Channel::Zone(1), true);
        let p = rig.add_program("Orto", &[(1, 1), (0, 1)]);

        let started = Instant::now();
        assert_eq!(rig.engine.execute(p, true).await, RunOutcome::Completed);
        assert!(started.elapsed() < Duration::from_secs(120));
        assert!(rig.board.writes().contains(&(Channel::Zone(0), true)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_run_finishes_before_the_next_begins() {
        let rig = Rig::new();
        let a = rig.add_program("A", &[(0, 10)]);
        let b = rig
            .programs
            .create(crate::testkit::program("B", &[(1, 1)], "07:00"))
            .unwrap();

        let engine = rig.engine.clone();
        let first = tokio::spawn(async move { engine.execute(a, true).await });
        sleep(Duration::from_secs(5)).await;
        rig.engine.stop();

        // The record is already idle, so the second run is accepted and
        // waits for the first to finalize.
        assert_eq!(rig.engine.execute(b, true).await, RunOutcome::Completed);
        assert_eq!(first.await.unwrap(), RunOutcome::Interrupted);
        assert!(!rig.record.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_caller_still_finalizes() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 10)]);

        let _ = timeout(Duration::from_secs(20), rig.engine.execute(p, true)).await;

        assert!(!rig.record.is_running());
        assert_eq!(rig.zones.active_count(), 0);
        assert_eq!(rig.engine.phase(), RunPhase::Idle);
    }
}
