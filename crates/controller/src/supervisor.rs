//! Health supervisor: periodic audit of zones, programs, relay, web service,
//! memory and connectivity, with forced corrections.
//!
//! Every check runs on every tick and reports its own flag; one failing check
//! never prevents the others from running.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::System;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, RunPhase, StopOutcome};
use crate::events::{EventKind, EventLog};
use crate::programs::ProgramStore;
use crate::record::RecordStore;
use crate::zones::ZoneActuator;

const STARTUP_DELAY_SEC: u64 = 30;
const CHECK_INTERVAL_SEC: u64 = 60;

/// No zone stays open longer than this, whatever its configured duration.
const MAX_ZONE_MINUTES: u64 = 180;

const PROBE_FAILURE_LIMIT: u32 = 3;
const MAX_SERVICE_RESTARTS: u32 = 3;
const CONNECTIVITY_FAILURE_LIMIT: u32 = 3;

const MIN_FREE_BYTES: u64 = 20_000;
const MIN_FREE_PERCENT: u64 = 10;
/// Events kept when reclaiming memory.
const RECLAIM_KEEP_EVENTS: usize = 20;

/// An all-OK summary is logged once every this many ticks.
const SUMMARY_EVERY: u64 = 10;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// A long-running service the supervisor may restart.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
}

/// Network link owned by the host.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn recover(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub available: u64,
    pub total: u64,
}

impl MemorySample {
    fn is_low(&self) -> bool {
        self.available < MIN_FREE_BYTES
            || (self.total > 0 && self.available * 100 < self.total * MIN_FREE_PERCENT)
    }
}

pub trait MemorySource: Send {
    fn sample(&mut self) -> MemorySample;
}

/// Host memory through sysinfo.
pub struct SysinfoMemory {
    system: System,
}

impl SysinfoMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SysinfoMemory {
    fn sample(&mut self) -> MemorySample {
        self.system.refresh_memory();
        MemorySample {
            available: self.system.available_memory(),
            total: self.system.total_memory(),
        }
    }
}

/// Link state from `/sys/class/net/<iface>/operstate`. Reconnecting is
/// left to the host's network manager; `recover` only re-reads the state.
pub struct LinkStateMonitor {
    operstate: PathBuf,
}

impl LinkStateMonitor {
    pub fn new(iface: &str) -> Self {
        Self {
            operstate: PathBuf::from(format!("/sys/class/net/{iface}/operstate")),
        }
    }
}

#[async_trait]
impl NetworkMonitor for LinkStateMonitor {
    async fn is_connected(&self) -> bool {
        tokio::fs::read_to_string(&self.operstate)
            .await
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }

    async fn recover(&self) -> Result<()> {
        if self.is_connected().await {
            Ok(())
        } else {
            anyhow::bail!("link {} still down", self.operstate.display())
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthFlags {
    pub web_server: bool,
    pub connectivity: bool,
    pub memory: bool,
    pub zones: bool,
    pub programs: bool,
    pub safety_relay: bool,
}

impl Default for HealthFlags {
    fn default() -> Self {
        Self {
            web_server: true,
            connectivity: true,
            memory: true,
            zones: true,
            programs: true,
            safety_relay: true,
        }
    }
}

impl HealthFlags {
    fn all_ok(&self) -> bool {
        self.web_server
            && self.connectivity
            && self.memory
            && self.zones
            && self.programs
            && self.safety_relay
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounters {
    pub web_server: u32,
    pub connectivity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    pub memory_available: u64,
    pub memory_total: u64,
    pub reclaim_runs: u64,
    pub connectivity_recoveries: u64,
    pub server_restarts: u32,
    pub zone_corrections: u64,
    pub program_corrections: u64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub health: HealthFlags,
    pub failures: FailureCounters,
    pub metrics: HealthMetrics,
}

/// Read side of the supervisor, shared with the control layer.
#[derive(Clone, Default)]
pub struct HealthHandle {
    inner: Arc<Mutex<HealthSnapshot>>,
}

impl HealthHandle {
    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    zones: ZoneActuator,
    record: RecordStore,
    programs: ProgramStore,
    engine: Engine,
    events: EventLog,
    service: Option<Arc<dyn ServiceProbe>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    memory: Box<dyn MemorySource>,
    health: HealthHandle,
    /// Program seen running with no open zone on the previous tick.
    idle_run: Option<String>,
}

impl Supervisor {
    pub fn new(
        zones: ZoneActuator,
        record: RecordStore,
        programs: ProgramStore,
        engine: Engine,
        events: EventLog,
    ) -> Self {
        Self {
            zones,
            record,
            programs,
            engine,
            events,
            service: None,
            network: None,
            memory: Box::new(SysinfoMemory::new()),
            health: HealthHandle::default(),
            idle_run: None,
        }
    }

    pub fn with_service(mut self, service: Arc<dyn ServiceProbe>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_memory(mut self, memory: Box<dyn MemorySource>) -> Self {
        self.memory = memory;
        self
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    /// Run the audit loop until `shutdown` fires. Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(STARTUP_DELAY_SEC)) => {}
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(CHECK_INTERVAL_SEC));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_sec = CHECK_INTERVAL_SEC, "supervisor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check().await;
        }

        info!("supervisor stopped");
    }

    /// One full audit.
    pub async fn check(&mut self) -> HealthSnapshot {
        let zones_ok = self.check_zones();
        let relay_ok = self.check_safety_relay();
        let programs_ok = self.check_programs();
        let web_ok = self.check_service().await;
        let memory_ok = self.check_memory();
        let net_ok = self.check_connectivity().await;

        let snapshot = {
            let mut snap = self.health.lock();
            snap.health = HealthFlags {
                web_server: web_ok,
                connectivity: net_ok,
                memory: memory_ok,
                zones: zones_ok,
                programs: programs_ok,
                safety_relay: relay_ok,
            };
            snap.metrics.uptime_secs = self.events.uptime_secs();
            snap.metrics.ticks += 1;
            snap.clone()
        };

        if snapshot.health.all_ok() {
            if snapshot.metrics.ticks % SUMMARY_EVERY == 0 {
                info!(
                    ticks = snapshot.metrics.ticks,
                    uptime_secs = snapshot.metrics.uptime_secs,
                    "health check: all systems OK"
                );
            }
        } else {
            warn!(flags = ?snapshot.health, failures = ?snapshot.failures, "health check: problems detected");
        }
        snapshot
    }

    fn check_zones(&mut self) -> bool {
        let mut ok = true;

        for zone in self.zones.active_zones() {
            let reason = if zone.remaining_seconds == 0 {
                "timer overdue"
            } else if zone.elapsed_seconds > MAX_ZONE_MINUTES * 60 {
                "open beyond the hard ceiling"
            } else {
                continue;
            };
            self.events.warn(
                EventKind::Supervisor,
                format!("zone {} {reason}, forcing it off", zone.id),
            );
            self.force_zone_off(zone.id);
            self.health.lock().metrics.zone_corrections += 1;
            ok = false;
        }

        let record = match self.record.load() {
            Ok(record) => record,
            Err(e) => {
                self.events.error(EventKind::Supervisor, format!("execution record unreadable: {e}"));
                return false;
            }
        };
        let between_steps = matches!(self.engine.phase(), RunPhase::Preparing | RunPhase::Delay);
        if !record.program_running || self.zones.active_count() > 0 || between_steps {
            self.idle_run = None;
            return ok;
        }

        // A step's zone closes on its own timer just before the engine moves
        // on, so only a second sighting in a row means the run is orphaned.
        let id = record.current_program_id.unwrap_or_default();
        if self.idle_run.as_deref() != Some(id.as_str()) {
            tracing::debug!(program = %id, "running program has no open zone, rechecking next tick");
            self.idle_run = Some(id);
            return ok;
        }

        self.idle_run = None;
        self.events.warn(
            EventKind::Supervisor,
            format!("program {id} marked running with no active zone on two checks, forcing stop"),
        );
        self.force_stop();
        false
    }

    fn check_safety_relay(&mut self) -> bool {
        if !self.zones.relay_engaged() || self.zones.active_count() > 0 {
            return true;
        }
        self.events.warn(
            EventKind::Supervisor,
            "safety relay engaged with no active zone, forcing all off",
        );
        if let Err(e) = self.zones.deactivate_all() {
            self.events.error(EventKind::Supervisor, format!("forced all off: {e}"));
        }
        self.health.lock().metrics.zone_corrections += 1;
        false
    }

    fn check_programs(&mut self) -> bool {
        let Some(id) = self.record.current_program_id() else {
            return true;
        };
        if !self.record.is_running() || self.programs.contains(&id) {
            return true;
        }
        self.events.warn(
            EventKind::Supervisor,
            format!("running program {id} no longer exists, forcing stop"),
        );
        self.force_stop();
        false
    }

    async fn check_service(&mut self) -> bool {
        let Some(service) = self.service.clone() else {
            return true;
        };

        match service.probe().await {
            Ok(()) => {
                self.health.lock().failures.web_server = 0;
                true
            }
            Err(e) => {
                let (failures, restarts) = {
                    let mut snap = self.health.lock();
                    snap.failures.web_server += 1;
                    (snap.failures.web_server, snap.metrics.server_restarts)
                };
                warn!(failures, "web server probe failed: {e:#}");

                if failures >= PROBE_FAILURE_LIMIT {
                    if restarts < MAX_SERVICE_RESTARTS {
                        self.events.warn(
                            EventKind::Supervisor,
                            format!(
                                "web server unresponsive after {failures} probes, restarting ({}/{MAX_SERVICE_RESTARTS})",
                                restarts + 1
                            ),
                        );
                        if let Err(e) = service.restart().await {
                            self.events.error(
                                EventKind::Supervisor,
                                format!("web server restart failed: {e:#}"),
                            );
                        }
                        let mut snap = self.health.lock();
                        snap.metrics.server_restarts += 1;
                        snap.failures.web_server = 0;
                    } else {
                        self.events.error(
                            EventKind::Supervisor,
                            format!(
                                "web server unresponsive, restart limit of {MAX_SERVICE_RESTARTS} reached"
                            ),
                        );
                    }
                }
                false
            }
        }
    }

    fn check_memory(&mut self) -> bool {
        let mut sample = self.memory.sample();
        if sample.is_low() {
            self.events.warn(
                EventKind::Supervisor,
                format!(
                    "low memory ({} of {} bytes available), reclaiming",
                    sample.available, sample.total
                ),
            );
            let dropped = self.events.trim(RECLAIM_KEEP_EVENTS);
            tracing::debug!(dropped, "event history trimmed");
            self.health.lock().metrics.reclaim_runs += 1;
            sample = self.memory.sample();
        }

        let mut snap = self.health.lock();
        snap.metrics.memory_available = sample.available;
        snap.metrics.memory_total = sample.total;
        !sample.is_low()
    }

    async fn check_connectivity(&mut self) -> bool {
        let Some(network) = self.network.clone() else {
            return true;
        };

        if network.is_connected().await {
            self.health.lock().failures.connectivity = 0;
            return true;
        }

        let failures = {
            let mut snap = self.health.lock();
            snap.failures.connectivity += 1;
            snap.failures.connectivity
        };
        if failures >= CONNECTIVITY_FAILURE_LIMIT {
            self.events.warn(
                EventKind::Supervisor,
                format!("network down for {failures} checks, attempting recovery"),
            );
            if let Err(e) = network.recover().await {
                self.events.error(EventKind::Supervisor, format!("network recovery failed: {e:#}"));
            }
            let mut snap = self.health.lock();
            snap.metrics.connectivity_recoveries += 1;
            snap.failures.connectivity = 0;
        }
        false
    }

    fn force_zone_off(&self, zone_id: u8) {
        if let Err(e) = self.zones.deactivate(zone_id) {
            self.events.error(
                EventKind::Supervisor,
                format!("zone {zone_id} did not close ({e}), forcing all off"),
            );
            if let Err(e) = self.zones.deactivate_all() {
                self.events.error(EventKind::Supervisor, format!("forced all off: {e}"));
            }
        }
    }

    fn force_stop(&self) {
        match self.engine.stop() {
            StopOutcome::StoppedWithErrors => self.events.error(
                EventKind::Supervisor,
                "forced stop left errors, see previous events",
            ),
            StopOutcome::Stopped | StopOutcome::NotRunning => {}
        }
        self.health.lock().metrics.program_corrections += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunOutcome;
    use crate::testkit::Rig;
    use crate::valve::Channel;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::sleep;

    struct PlentyOfMemory;

    impl MemorySource for PlentyOfMemory {
        fn sample(&mut self) -> MemorySample {
            MemorySample {
                available: 512 * 1024 * 1024,
                total: 1024 * 1024 * 1024,
            }
        }
    }

    /// Low on the first sample, fine after reclaiming.
    struct TightMemory {
        samples: u32,
    }

    impl MemorySource for TightMemory {
        fn sample(&mut self) -> MemorySample {
            self.samples += 1;
            let available = if self.samples == 1 { 10_000 } else { 400_000 };
            MemorySample {
                available,
                total: 1_000_000,
            }
        }
    }

    #[derive(Default)]
    struct DeadService {
        probes: AtomicU32,
        restarts: AtomicU32,
    }

    #[async_trait]
    impl ServiceProbe for DeadService {
        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection refused")
        }

        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlakyLink {
        up: AtomicBool,
        recoveries: AtomicU32,
    }

    #[async_trait]
    impl NetworkMonitor for FlakyLink {
        async fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn recover(&self) -> Result<()> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn supervisor(rig: &Rig) -> Supervisor {
        Supervisor::new(
            rig.zones.clone(),
            rig.record.clone(),
            rig.programs.clone(),
            rig.engine.clone(),
            rig.events.clone(),
        )
        .with_memory(Box::new(PlentyOfMemory))
    }

    #[tokio::test]
    async fn healthy_system_reports_all_ok() {
        let rig = Rig::new();
        let snap = supervisor(&rig).check().await;
        assert!(snap.health.all_ok());
        assert_eq!(snap.metrics.ticks, 1);
        assert_eq!(snap.metrics.zone_corrections, 0);
    }

    // -- Zones ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn zone_beyond_ceiling_is_forced_off() {
        let rig = Rig::with_settings(|s| s.max_zone_duration = 240);
        rig.zones.activate(2, 240).unwrap();
        let mut sup = supervisor(&rig);

        sleep(Duration::from_secs(170 * 60)).await;
        assert!(sup.check().await.health.zones);
        assert!(rig.zones.is_active(2));

        sleep(Duration::from_secs(11 * 60)).await;
        let snap = sup.check().await;
        assert!(!snap.health.zones);
        assert_eq!(snap.metrics.zone_corrections, 1);
        assert!(!rig.zones.is_active(2));
        assert!(!rig.zones.relay_engaged());
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_zone_is_forced_off() {
        let rig = Rig::new();
        rig.zones.activate(4, 1).unwrap();
        rig.board.set_failing(Channel::Zone(4), true);

        // The auto-off timer fires but cannot close the valve.
        sleep(Duration::from_secs(61)).await;
        assert!(rig.zones.is_active(4));
        assert_eq!(rig.zones.active_zones()[0].remaining_seconds, 0);
        rig.board.set_failing(Channel::Zone(4), false);

        let snap = supervisor(&rig).check().await;
        assert!(!snap.health.zones);
        assert_eq!(snap.metrics.zone_corrections, 1);
        assert!(!rig.zones.is_active(4));
        assert!(!rig.zones.relay_engaged());
    }

    #[tokio::test]
    async fn running_record_without_zones_is_stopped_on_second_check() {
        let rig = Rig::new();
        rig.record.try_begin("ghost").unwrap();
        let mut sup = supervisor(&rig);

        let snap = sup.check().await;
        assert!(snap.health.zones);
        assert_eq!(snap.metrics.program_corrections, 0);
        assert!(rig.record.is_running());

        let snap = sup.check().await;
        assert!(!snap.health.zones);
        assert_eq!(snap.metrics.program_corrections, 1);
        assert!(!rig.record.is_running());
    }

    #[tokio::test]
    async fn open_zone_between_checks_resets_the_orphan_count() {
        let rig = Rig::new();
        rig.record.try_begin("ghost").unwrap();
        let mut sup = supervisor(&rig);

        sup.check().await;
        let lease = rig.zones.activate_for_program(0, 5).unwrap();
        sup.check().await;
        rig.zones.deactivate_lease(&lease).unwrap();

        let snap = sup.check().await;
        assert_eq!(snap.metrics.program_corrections, 0);
        assert!(rig.record.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn supervised_run_completes_untouched() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 1), (1, 1)]);
        let id = p.id.clone();
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });
        let mut sup = supervisor(&rig);

        // Checks land on every step boundary, where the zone timer and the
        // engine wake at the same instant.
        for _ in 0..200 {
            sleep(Duration::from_secs(1)).await;
            sup.check().await;
        }

        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        assert_eq!(sup.health().snapshot().metrics.program_corrections, 0);
        assert!(rig.programs.get(&id).unwrap().last_run_date.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn program_between_steps_is_left_alone() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 1), (1, 1)]);
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(90)).await;
        assert_eq!(rig.engine.phase(), RunPhase::Delay);

        let snap = supervisor(&rig).check().await;
        assert!(snap.health.all_ok());
        assert!(rig.record.is_running());
        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
    }

    // -- Relay ---------------------------------------------------------------

    #[tokio::test]
    async fn stuck_relay_is_released() {
        let rig = Rig::new();
        rig.zones.activate(0, 5).unwrap();
        rig.board.set_failing(Channel::SafetyRelay, true);
        assert!(rig.zones.deactivate(0).is_err());
        assert!(rig.zones.relay_engaged());
        assert_eq!(rig.zones.active_count(), 0);

        rig.board.set_failing(Channel::SafetyRelay, false);
        let snap = supervisor(&rig).check().await;
        assert!(!snap.health.safety_relay);
        assert!(!rig.zones.relay_engaged());
        assert_eq!(rig.board.is_open(Channel::SafetyRelay), Some(false));
    }

    // -- Programs ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn deleted_running_program_is_stopped() {
        let rig = Rig::new();
        let p = rig.add_program("Orto", &[(0, 10)]);
        let id = p.id.clone();
        let engine = rig.engine.clone();
        let run = tokio::spawn(async move { engine.execute(p, true).await });

        sleep(Duration::from_secs(5)).await;
        rig.programs.delete(&id).unwrap();

        let snap = supervisor(&rig).check().await;
        assert!(!snap.health.programs);
        assert_eq!(snap.metrics.program_corrections, 1);
        assert_eq!(run.await.unwrap(), RunOutcome::Interrupted);
        assert_eq!(rig.zones.active_count(), 0);
    }

    // -- Service -------------------------------------------------------------

    #[tokio::test]
    async fn service_restarts_are_bounded() {
        let rig = Rig::new();
        let service = Arc::new(DeadService::default());
        let mut sup = supervisor(&rig).with_service(service.clone());

        for _ in 0..15 {
            assert!(!sup.check().await.health.web_server);
        }
        assert_eq!(service.probes.load(Ordering::SeqCst), 15);
        assert_eq!(service.restarts.load(Ordering::SeqCst), MAX_SERVICE_RESTARTS);
        assert_eq!(sup.health().snapshot().metrics.server_restarts, MAX_SERVICE_RESTARTS);
    }

    // -- Memory --------------------------------------------------------------

    #[tokio::test]
    async fn low_memory_triggers_reclaim() {
        let rig = Rig::new();
        for i in 0..100 {
            rig.events.info(EventKind::System, format!("filler {i}"));
        }
        let mut sup = supervisor(&rig).with_memory(Box::new(TightMemory { samples: 0 }));

        let snap = sup.check().await;
        assert_eq!(snap.metrics.reclaim_runs, 1);
        assert!(snap.health.memory);
        assert_eq!(snap.metrics.memory_available, 400_000);
        // Reclaim keeps a short tail plus the warnings logged since.
        assert!(rig.events.len() < 30);
    }

    #[test]
    fn low_memory_thresholds() {
        let low_bytes = MemorySample { available: 19_999, total: 100_000 };
        let low_share = MemorySample { available: 90_000, total: 1_000_000 };
        let fine = MemorySample { available: 200_000, total: 1_000_000 };
        assert!(low_bytes.is_low());
        assert!(low_share.is_low());
        assert!(!fine.is_low());
    }

    // -- Connectivity --------------------------------------------------------

    #[tokio::test]
    async fn connectivity_recovery_after_three_failures() {
        let rig = Rig::new();
        let link = Arc::new(FlakyLink::default());
        let mut sup = supervisor(&rig).with_network(link.clone());

        sup.check().await;
        sup.check().await;
        assert_eq!(link.recoveries.load(Ordering::SeqCst), 0);
        let snap = sup.check().await;
        assert!(!snap.health.connectivity);
        assert_eq!(link.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(snap.metrics.connectivity_recoveries, 1);

        link.up.store(true, Ordering::SeqCst);
        let snap = sup.check().await;
        assert!(snap.health.connectivity);
        assert_eq!(snap.failures.connectivity, 0);
    }

    #[tokio::test]
    async fn snapshot_serializes_for_the_health_endpoint() {
        let rig = Rig::new();
        let snap = supervisor(&rig).check().await;
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["health"]["safety_relay"], true);
        assert_eq!(json["metrics"]["ticks"], 1);
        assert_eq!(json["failures"]["web_server"], 0);
    }
}
