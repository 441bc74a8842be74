//! Zone actuation: relay outputs, safety interlock, auto-off timers.
//!
//! The actuator is the only owner of the relay board. The safety relay is
//! engaged exactly while at least one zone is active and only switched at the
//! 0 -> 1 and 1 -> 0 boundaries.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Settings, SettingsSource};
use crate::error::{ControlError, Result};
use crate::events::{EventKind, EventLog};
use crate::record::RecordStore;
use crate::valve::{Channel, RelayBoard};

/// Visible zone as reported to the control layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub id: u8,
    pub name: String,
    pub active: bool,
    pub remaining_seconds: u64,
}

/// Active zone as seen by the supervisor, visible or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveZone {
    pub id: u8,
    pub duration_minutes: u32,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
}

/// A zone opened on behalf of a program run. The token identifies that
/// particular opening, so a later manual run of the same zone is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ZoneLease {
    pub zone_id: u8,
    pub token: u64,
    /// When the auto-off timer is due.
    pub deadline: Instant,
}

struct ZoneRun {
    started_at: Instant,
    duration_minutes: u32,
    /// Generation of the timer that owns this run.
    token: u64,
    timer: JoinHandle<()>,
}

impl ZoneRun {
    fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn remaining_seconds(&self) -> u64 {
        (u64::from(self.duration_minutes) * 60).saturating_sub(self.elapsed_seconds())
    }
}

/// Who is closing a zone. The expiry path must not abort its own task.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Closer {
    Caller,
    Timer,
}

struct ActuatorState {
    board: Box<dyn RelayBoard>,
    runs: HashMap<u8, ZoneRun>,
    relay_engaged: bool,
    next_token: u64,
}

struct Inner {
    settings: Arc<dyn SettingsSource>,
    record: RecordStore,
    events: EventLog,
    state: Mutex<ActuatorState>,
}

#[derive(Clone)]
pub struct ZoneActuator {
    inner: Arc<Inner>,
}

impl ZoneActuator {
    pub fn new(
        board: Box<dyn RelayBoard>,
        settings: Arc<dyn SettingsSource>,
        record: RecordStore,
        events: EventLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                record,
                events,
                state: Mutex::new(ActuatorState {
                    board,
                    runs: HashMap::new(),
                    relay_engaged: false,
                    next_token: 0,
                }),
            }),
        }
    }

    /// Manual activation. Refused with `Busy` while a program runs.
    pub fn activate(&self, zone_id: u8, duration_minutes: u32) -> Result<()> {
        let settings = self.inner.settings.current();
        let name = zone_name(&settings, zone_id)?;

        let record = self.inner.record.load()?;
        if record.program_running {
            return Err(ControlError::Busy(format!(
                "program {} is running",
                record.current_program_id.as_deref().unwrap_or("?")
            )));
        }

        self.start(&settings, zone_id, &name, duration_minutes)
            .map(|_| ())
    }

    /// Activation on behalf of the execution engine, which already holds the
    /// execution record.
    pub(crate) fn activate_for_program(
        &self,
        zone_id: u8,
        duration_minutes: u32,
    ) -> Result<ZoneLease> {
        let settings = self.inner.settings.current();
        let name = zone_name(&settings, zone_id)?;
        self.start(&settings, zone_id, &name, duration_minutes)
    }

    /// Close the zone only if it is still the opening `lease` refers to.
    pub(crate) fn deactivate_lease(&self, lease: &ZoneLease) -> Result<()> {
        let mut st = self.inner.lock();
        match st.runs.get(&lease.zone_id) {
            Some(run) if run.token == lease.token => {}
            _ => return Ok(()),
        }
        self.inner.close(&mut st, lease.zone_id, Closer::Caller)
    }

    pub fn deactivate(&self, zone_id: u8) -> Result<()> {
        let configured = self.inner.settings.current().zone(zone_id).is_some();
        let mut st = self.inner.lock();
        if !configured && !st.runs.contains_key(&zone_id) {
            return Err(ControlError::NotFound(format!("zone {zone_id} is not configured")));
        }
        self.inner.close(&mut st, zone_id, Closer::Caller)
    }

    /// Close every zone and drop the safety relay. The active set is empty on
    /// return even when outputs fail; failures are reported afterwards.
    pub fn deactivate_all(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();
        let mut failures = Vec::new();

        let ids: Vec<u8> = st.runs.keys().copied().collect();
        for zone_id in ids {
            if let Err(e) = inner.close(&mut st, zone_id, Closer::Caller) {
                failures.push(format!("zone {zone_id}: {}", e.reason()));
            }
        }

        if !st.runs.is_empty() {
            inner.events.warn(
                EventKind::Zone,
                format!("{} zone(s) still active, forcing outputs closed", st.runs.len()),
            );
            let stuck: Vec<(u8, ZoneRun)> = st.runs.drain().collect();
            for (zone_id, run) in stuck {
                run.timer.abort();
                if let Err(e) = st.board.drive(Channel::Zone(zone_id), false) {
                    inner.events.error(
                        EventKind::Zone,
                        format!("forced close of zone {zone_id} failed: {e:#}"),
                    );
                }
            }
        }

        match inner.drive_relay(&mut st, false) {
            Ok(()) => st.relay_engaged = false,
            Err(e) => failures.push(format!("safety relay: {}", e.reason())),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Hardware(failures.join("; ")))
        }
    }

    /// Visible zones with their remaining time.
    pub fn status(&self) -> Vec<ZoneStatus> {
        let settings = self.inner.settings.current();
        let st = self.inner.lock();
        settings
            .zones
            .iter()
            .filter(|z| z.visible)
            .map(|z| {
                let run = st.runs.get(&z.id);
                ZoneStatus {
                    id: z.id,
                    name: z.name.clone(),
                    active: run.is_some(),
                    remaining_seconds: run.map_or(0, ZoneRun::remaining_seconds),
                }
            })
            .collect()
    }

    pub fn active_zones(&self) -> Vec<ActiveZone> {
        let st = self.inner.lock();
        let mut zones: Vec<ActiveZone> = st
            .runs
            .iter()
            .map(|(id, run)| ActiveZone {
                id: *id,
                duration_minutes: run.duration_minutes,
                elapsed_seconds: run.elapsed_seconds(),
                remaining_seconds: run.remaining_seconds(),
            })
            .collect();
        zones.sort_by_key(|z| z.id);
        zones
    }

    pub fn is_active(&self, zone_id: u8) -> bool {
        self.inner.lock().runs.contains_key(&zone_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn relay_engaged(&self) -> bool {
        self.inner.lock().relay_engaged
    }

    fn start(
        &self,
        settings: &Settings,
        zone_id: u8,
        name: &str,
        duration_minutes: u32,
    ) -> Result<ZoneLease> {
        if duration_minutes == 0 || duration_minutes > settings.max_zone_duration {
            return Err(ControlError::InvalidInput(format!(
                "duration must be between 1 and {} minutes, got {duration_minutes}",
                settings.max_zone_duration
            )));
        }

        let inner = &self.inner;
        let mut st = inner.lock();

        let already_active = st.runs.contains_key(&zone_id);
        if !already_active && st.runs.len() >= settings.max_active_zones {
            return Err(ControlError::CapacityExceeded(format!(
                "at most {} zones may be active at once",
                settings.max_active_zones
            )));
        }

        let engaged_here = st.runs.is_empty();
        if engaged_here {
            inner.drive_relay(&mut st, true)?;
            st.relay_engaged = true;
        }

        if let Err(e) = st.board.drive(Channel::Zone(zone_id), true) {
            if engaged_here {
                match inner.drive_relay(&mut st, false) {
                    Ok(()) => st.relay_engaged = false,
                    Err(relay_err) => inner.events.error(
                        EventKind::Zone,
                        format!("safety relay rollback failed: {}", relay_err.reason()),
                    ),
                }
            }
            inner.events.error(
                EventKind::Zone,
                format!("zone {zone_id} ({name}) could not be opened: {e:#}"),
            );
            return Err(ControlError::hardware(e));
        }

        if let Some(previous) = st.runs.remove(&zone_id) {
            previous.timer.abort();
        }

        st.next_token += 1;
        let token = st.next_token;
        let started_at = Instant::now();
        let deadline = started_at + Duration::from_secs(u64::from(duration_minutes) * 60);
        let timer = spawn_timer(Arc::downgrade(&self.inner), zone_id, token, deadline);
        st.runs.insert(
            zone_id,
            ZoneRun {
                started_at,
                duration_minutes,
                token,
                timer,
            },
        );

        let verb = if already_active { "restarted" } else { "opened" };
        inner.events.info(
            EventKind::Zone,
            format!("zone {zone_id} ({name}) {verb} for {duration_minutes} min"),
        );
        Ok(ZoneLease {
            zone_id,
            token,
            deadline,
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ActuatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close one zone. A failed close keeps the run: the valve may still be
    /// open, so the relay stays engaged with it.
    fn close(&self, st: &mut ActuatorState, zone_id: u8, closer: Closer) -> Result<()> {
        if !st.runs.contains_key(&zone_id) {
            return Ok(());
        }

        let closed = st.board.drive(Channel::Zone(zone_id), false);

        if let Err(e) = &closed {
            self.events.error(
                EventKind::Zone,
                format!("zone {zone_id} could not be closed: {e:#}"),
            );
        } else if let Some(run) = st.runs.remove(&zone_id) {
            if closer == Closer::Caller {
                run.timer.abort();
            }
            let how = match closer {
                Closer::Caller => "closed",
                Closer::Timer => "closed by timer",
            };
            self.events.info(
                EventKind::Zone,
                format!("zone {zone_id} {how} after {}s", run.elapsed_seconds()),
            );
        }

        let mut relay_result = Ok(());
        if st.runs.is_empty() && st.relay_engaged {
            relay_result = self.drive_relay(st, false);
            if relay_result.is_ok() {
                st.relay_engaged = false;
            }
        }

        closed.map_err(ControlError::hardware)?;
        relay_result
    }

    /// Switch the safety relay. A board without one only keeps bookkeeping.
    fn drive_relay(&self, st: &mut ActuatorState, engage: bool) -> Result<()> {
        if !st.board.has(Channel::SafetyRelay) {
            return Ok(());
        }
        match st.board.drive(Channel::SafetyRelay, engage) {
            Ok(()) => {
                let what = if engage { "engaged" } else { "released" };
                self.events.info(EventKind::Zone, format!("safety relay {what}"));
                Ok(())
            }
            Err(e) => {
                self.events.error(
                    EventKind::Zone,
                    format!("safety relay could not be switched: {e:#}"),
                );
                Err(ControlError::hardware(e))
            }
        }
    }

    fn expire(&self, zone_id: u8, token: u64) {
        let mut st = self.lock();
        match st.runs.get(&zone_id) {
            Some(run) if run.token == token => {}
            _ => {
                tracing::debug!(zone = zone_id, token, "stale zone timer ignored");
                return;
            }
        }
        if let Err(e) = self.close(&mut st, zone_id, Closer::Timer) {
            tracing::warn!(zone = zone_id, "timer could not close zone: {e}");
        }
    }
}

fn spawn_timer(inner: Weak<Inner>, zone_id: u8, token: u64, deadline: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(zone_id, token);
        }
    })
}

fn zone_name(settings: &Settings, zone_id: u8) -> Result<String> {
    settings
        .zone(zone_id)
        .map(|z| z.name.clone())
        .ok_or_else(|| ControlError::NotFound(format!("zone {zone_id} is not configured")))
}

// ===========================================================================
// Tests
// ===========================================================================
