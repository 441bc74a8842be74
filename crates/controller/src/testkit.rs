//! Fully wired controller on a mock board and a temp data dir.

use std::sync::Arc;
use tempfile::TempDir;
use time::macros::datetime;
use time::PrimitiveDateTime;

use crate::clock::FixedClock;
use crate::config::{Settings, StaticSettings};
use crate::engine::Engine;
use crate::events::EventLog;
use crate::programs::{Program, ProgramStore, Recurrence, Step};
use crate::record::RecordStore;
use crate::valve::MockBoard;
use crate::zones::ZoneActuator;

pub struct Rig {
    pub settings: StaticSettings,
    pub board: MockBoard,
    pub clock: Arc<FixedClock>,
    pub events: EventLog,
    pub record: RecordStore,
    pub zones: ZoneActuator,
    pub programs: ProgramStore,
    pub engine: Engine,
    pub dir: TempDir,
}

/// Saturday 15 June 2024, 06:00.
pub const START: PrimitiveDateTime = datetime!(2024-06-15 06:00);

impl Rig {
    pub fn new() -> Self {
        Self::with_settings(|s| s.activation_delay = 1)
    }

    pub fn with_settings(f: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut defaults = Settings::default();
        f(&mut defaults);

        let board = MockBoard::new(&defaults.zone_pins(), defaults.safety_relay_pin());
        let settings = StaticSettings::new(defaults);
        let clock = Arc::new(FixedClock::new(START));
        let events = EventLog::new();
        let record =
            RecordStore::open(dir.path().join("program_state.json"), events.clone()).unwrap();
        let zones = ZoneActuator::new(
            Box::new(board.clone()),
            Arc::new(settings.clone()),
            record.clone(),
            events.clone(),
        );
        let programs =
            ProgramStore::open(dir.path().join("programs.json"), events.clone()).unwrap();
        let engine = Engine::new(
            zones.clone(),
            record.clone(),
            programs.clone(),
            Arc::new(settings.clone()),
            clock.clone(),
            events.clone(),
        );

        Self {
            settings,
            board,
            clock,
            events,
            record,
            zones,
            programs,
            engine,
            dir,
        }
    }

    /// Store a June 06:00 daily program watering `steps` of `(zone, minutes)`.
    pub fn add_program(&self, name: &str, steps: &[(u8, u32)]) -> Program {
        self.programs
            .create(program(name, steps, "06:00"))
            .unwrap()
    }
}

pub fn program(name: &str, steps: &[(u8, u32)], at: &str) -> Program {
    Program {
        id: String::new(),
        name: name.to_string(),
        steps: steps
            .iter()
            .map(|(zone_id, duration_minutes)| Step {
                zone_id: *zone_id,
                duration_minutes: *duration_minutes,
            })
            .collect(),
        months: vec!["Giugno".to_string()],
        activation_time: at.to_string(),
        recurrence: Recurrence::Daily,
        interval_days: 1,
        automatic_enabled: true,
        last_run_date: None,
    }
}
