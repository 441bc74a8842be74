//! Control operations exposed to the web layer. Every operation returns a
//! [`ControlError`] with a kind and a human-readable reason on failure.

use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::SettingsSource;
use crate::engine::{Engine, RunPhase, StopOutcome};
use crate::error::{ControlError, Result};
use crate::events::{EventKind, EventLog, SystemEvent};
use crate::programs::{Program, ProgramStore};
use crate::record::RecordStore;
use crate::scheduler::Scheduler;
use crate::supervisor::{HealthHandle, HealthSnapshot};
use crate::zones::{ZoneActuator, ZoneStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub uptime_secs: u64,
    pub program_running: bool,
    pub current_program_id: Option<String>,
    pub phase: RunPhase,
    pub safety_relay_engaged: bool,
    pub active_zones: usize,
    pub automatic_programs_enabled: bool,
    pub zones: Vec<ZoneStatus>,
}

#[derive(Clone)]
pub struct Controller {
    settings: Arc<dyn SettingsSource>,
    record: RecordStore,
    zones: ZoneActuator,
    programs: ProgramStore,
    engine: Engine,
    scheduler: Scheduler,
    events: EventLog,
    health: HealthHandle,
}

impl Controller {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        record: RecordStore,
        zones: ZoneActuator,
        programs: ProgramStore,
        engine: Engine,
        clock: Arc<dyn Clock>,
        events: EventLog,
    ) -> Self {
        let scheduler = Scheduler::new(
            engine.clone(),
            programs.clone(),
            record.clone(),
            settings.clone(),
            clock,
            events.clone(),
        );
        Self {
            settings,
            record,
            zones,
            programs,
            engine,
            scheduler,
            events,
            health: HealthHandle::default(),
        }
    }

    /// Serve health from a running supervisor.
    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = health;
        self
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    // -- Zones ---------------------------------------------------------------

    pub fn activate_zone(&self, zone_id: u8, minutes: u32) -> Result<()> {
        self.zones.activate(zone_id, minutes)
    }

    pub fn deactivate_zone(&self, zone_id: u8) -> Result<()> {
        self.zones.deactivate(zone_id)
    }

    pub fn deactivate_all_zones(&self) -> Result<()> {
        self.zones.deactivate_all()
    }

    pub fn zone_status(&self) -> Vec<ZoneStatus> {
        self.zones.status()
    }

    // -- Programs ------------------------------------------------------------

    pub fn list_programs(&self) -> Vec<Program> {
        self.programs.list()
    }

    pub fn save_program(&self, program: Program) -> Result<Program> {
        self.check_step_zones(&program)?;
        self.programs.create(program)
    }

    /// Replace a program. If it is the one running, the run is stopped first,
    /// but only once the new definition has been accepted.
    pub fn update_program(&self, id: &str, program: Program) -> Result<Program> {
        self.check_step_zones(&program)?;
        self.programs.check_update(id, &program)?;
        self.stop_if_running(id, "updated");
        self.programs.update(id, program)
    }

    pub fn delete_program(&self, id: &str) -> Result<()> {
        if !self.programs.contains(id) {
            return Err(ControlError::NotFound(format!("program {id} does not exist")));
        }
        self.stop_if_running(id, "deleted");
        self.programs.delete(id)
    }

    /// Start `id` in the background. Returns once the run is handed to the
    /// engine.
    pub fn run_program_now(&self, id: &str) -> Result<()> {
        let program = self
            .programs
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("program {id} does not exist")))?;

        let record = self.record.load()?;
        if record.program_running {
            return Err(ControlError::Busy(format!(
                "program {} is already running",
                record.current_program_id.as_deref().unwrap_or("?")
            )));
        }

        self.events.info(
            EventKind::Program,
            format!("manual start of program {id} requested"),
        );
        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.execute(program, true).await;
        });
        Ok(())
    }

    pub fn stop_running_program(&self) -> Result<()> {
        match self.engine.stop() {
            StopOutcome::Stopped => Ok(()),
            StopOutcome::NotRunning => Err(ControlError::NotFound(
                "no program is running".to_string(),
            )),
            StopOutcome::StoppedWithErrors => Err(ControlError::Hardware(
                "program stopped, but zones or record could not be reset cleanly".to_string(),
            )),
        }
    }

    // -- Scheduling & health -----------------------------------------------

    pub async fn scheduler_tick(&self) -> Option<String> {
        self.scheduler.tick().await
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn events(&self) -> Vec<SystemEvent> {
        self.events.recent()
    }

    pub fn status(&self) -> ControllerStatus {
        let record = self.record.snapshot();
        ControllerStatus {
            uptime_secs: self.events.uptime_secs(),
            program_running: record.program_running,
            current_program_id: record.current_program_id,
            phase: self.engine.phase(),
            safety_relay_engaged: self.zones.relay_engaged(),
            active_zones: self.zones.active_count(),
            automatic_programs_enabled: self.settings.current().automatic_programs_enabled,
            zones: self.zones.status(),
        }
    }

    fn check_step_zones(&self, program: &Program) -> Result<()> {
        let settings = self.settings.current();
        let unknown: Vec<String> = program
            .steps
            .iter()
            .filter(|s| settings.zone(s.zone_id).is_none())
            .map(|s| s.zone_id.to_string())
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(ControlError::InvalidInput(format!(
                "unknown zone(s) in steps: {}",
                unknown.join(", ")
            )))
        }
    }

    fn stop_if_running(&self, id: &str, why: &str) {
        let running = self
            .record
            .load()
            .map(|r| r.program_running && r.current_program_id.as_deref() == Some(id))
            .unwrap_or_else(|_| self.record.current_program_id().as_deref() == Some(id));
        if running {
            self.events.info(
                EventKind::Program,
                format!("program {id} is running and is being {why}, stopping it"),
            );
            self.engine.stop();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{program, Rig};
    use std::time::Duration;
    use tokio::time::sleep;

    fn controller(rig: &Rig) -> Controller {
        Controller::new(
            Arc::new(rig.settings.clone()),
            rig.record.clone(),
            rig.zones.clone(),
            rig.programs.clone(),
            rig.engine.clone(),
            rig.clock.clone(),
            rig.events.clone(),
        )
    }

    #[tokio::test]
    async fn manual_zone_refused_while_program_runs() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        rig.record.try_begin("A").unwrap();

        let err = ctl.activate_zone(1, 5).unwrap_err();
        assert_eq!(err.kind(), "busy");
        assert!(ctl.zone_status().iter().all(|z| !z.active));
    }

    #[tokio::test]
    async fn save_program_checks_zones() {
        let rig = Rig::new();
        let ctl = controller(&rig);

        let err = ctl.save_program(program("X", &[(42, 5)], "06:00")).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.reason().contains("42"));

        let saved = ctl.save_program(program("Orto", &[(1, 5)], "06:00")).unwrap();
        assert_eq!(ctl.list_programs(), vec![saved]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_then_stop() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        let p = rig.add_program("Orto", &[(0, 10)]);

        assert_eq!(ctl.run_program_now("99").unwrap_err().kind(), "not_found");
        ctl.run_program_now(&p.id).unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(rig.zones.is_active(0));
        assert_eq!(ctl.status().current_program_id.as_deref(), Some(p.id.as_str()));

        assert_eq!(ctl.run_program_now(&p.id).unwrap_err().kind(), "busy");

        ctl.stop_running_program().unwrap();
        sleep(Duration::from_secs(2)).await;
        assert!(!ctl.status().program_running);
        assert_eq!(ctl.status().phase, RunPhase::Idle);
        assert_eq!(ctl.stop_running_program().unwrap_err().kind(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn updating_the_running_program_stops_it() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        let p = rig.add_program("Orto", &[(0, 10)]);
        ctl.run_program_now(&p.id).unwrap();
        sleep(Duration::from_secs(5)).await;

        let updated = ctl
            .update_program(&p.id, program("Orto 2", &[(0, 5)], "06:00"))
            .unwrap();
        assert_eq!(updated.name, "Orto 2");
        assert!(!rig.record.is_running());
        assert_eq!(rig.zones.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_update_leaves_the_run_alone() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        let p = rig.add_program("Orto", &[(0, 10)]);
        ctl.save_program(program("Prato", &[(1, 5)], "07:00")).unwrap();
        ctl.run_program_now(&p.id).unwrap();
        sleep(Duration::from_secs(5)).await;

        let err = ctl
            .update_program(&p.id, program("Orto", &[(0, 5)], "07:00"))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict_detected");
        assert!(rig.record.is_running());
        assert!(rig.zones.is_active(0));
        ctl.stop_running_program().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_the_running_program_stops_it() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        let p = rig.add_program("Orto", &[(0, 10)]);
        ctl.run_program_now(&p.id).unwrap();
        sleep(Duration::from_secs(5)).await;

        ctl.delete_program(&p.id).unwrap();
        assert!(!rig.record.is_running());
        assert!(ctl.list_programs().is_empty());
        assert_eq!(ctl.delete_program(&p.id).unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn deactivate_all_zones_clears_everything() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        ctl.activate_zone(0, 5).unwrap();
        ctl.activate_zone(1, 5).unwrap();

        ctl.deactivate_all_zones().unwrap();
        let status = ctl.status();
        assert_eq!(status.active_zones, 0);
        assert!(!status.safety_relay_engaged);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_tick_runs_due_program() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        let p = rig.add_program("Orto", &[(0, 1)]);
        assert_eq!(ctl.scheduler_tick().await, Some(p.id));
    }

    #[tokio::test]
    async fn events_are_newest_first() {
        let rig = Rig::new();
        let ctl = controller(&rig);
        ctl.activate_zone(3, 5).unwrap();
        assert!(ctl.events()[0].detail.contains("zone 3"));
    }
}
