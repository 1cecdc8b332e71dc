// src/engine.rs
use crate::{
    alarm_manager::{AlarmManager, Observation},
    alarms::{self, AlarmRule},
    config::{DeviceConfig, ScanConfig},
    device::DeviceIoManager,
    error::*,
    scan_plan::ScanPlan,
    signal::SignalBus,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Source name of alarms raised from polled registers.
pub const ALARM_SOURCE: &str = "modbus";

#[derive(Clone, Debug, Serialize)]
pub struct PollerStats {
    pub device: String,
    pub running: bool,
    pub cycles: u64,
    pub failed_blocks: u64,
    pub alarm_errors: u64,
    pub last_cycle_ms: u64,
    pub tag_count: usize,
    pub block_count: usize,
}

/// Outcome of one polling cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub blocks_ok: usize,
    pub blocks_failed: usize,
    pub readings: usize,
    pub evaluations: usize,
    pub transitions: usize,
}

/// Polling loop of one device: plan -> block reads -> decode -> rules -> lifecycle.
pub struct Poller {
    device: String,
    plan: ScanPlan,
    rules: Vec<AlarmRule>,
    io: Arc<DeviceIoManager>,
    bus: SignalBus,
    alarms: Arc<AlarmManager>,
    poll_interval: Duration,
    running: AtomicBool,
    wake: Notify,
    cycles: AtomicU64,
    failed_blocks: AtomicU64,
    alarm_errors: AtomicU64,
    last_cycle_ms: AtomicU64,
}

impl Poller {
    /// Build the device's scan plan and bind its rules.
    pub fn new(
        device: &DeviceConfig,
        scan: &ScanConfig,
        io: Arc<DeviceIoManager>,
        bus: SignalBus,
        alarms: Arc<AlarmManager>,
    ) -> Result<Self> {
        let plan = ScanPlan::build(&device.tags, scan)
            .map_err(|e| PlcError::Config(format!("Device '{}': {}", device.name, e)))?;
        info!(
            "Device '{}': {} tags in {} block reads, {} alarm rules",
            device.name,
            plan.tags.len(),
            plan.blocks.len(),
            device.alarm_rules.len()
        );
        Ok(Self::from_plan(
            device.name.clone(),
            plan,
            device.alarm_rules.clone(),
            io,
            bus,
            alarms,
            Duration::from_millis(scan.poll_interval_ms),
        ))
    }

    pub fn from_plan(
        device: String,
        plan: ScanPlan,
        rules: Vec<AlarmRule>,
        io: Arc<DeviceIoManager>,
        bus: SignalBus,
        alarms: Arc<AlarmManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            device,
            plan,
            rules,
            io,
            bus,
            alarms,
            poll_interval,
            running: AtomicBool::new(false),
            wake: Notify::new(),
            cycles: AtomicU64::new(0),
            failed_blocks: AtomicU64::new(0),
            alarm_errors: AtomicU64::new(0),
            last_cycle_ms: AtomicU64::new(0),
        }
    }

    /// Poll every `poll_interval` until [`Poller::stop`].
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PlcError::Config(format!(
                "Poller for '{}' is already running",
                self.device
            )));
        }
        info!(
            "Starting poller for '{}' every {}ms",
            self.device,
            self.poll_interval.as_millis()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let started = Instant::now();
            let report = self.poll_once().await;
            let elapsed = started.elapsed();
            self.last_cycle_ms
                .store(elapsed.as_millis() as u64, Ordering::Relaxed);
            debug!(
                "Poll cycle for '{}' in {:?}: {:?}",
                self.device, elapsed, report
            );
            if elapsed > self.poll_interval {
                warn!(
                    "Poll cycle for '{}' took {:?}, longer than the {:?} interval",
                    self.device, elapsed, self.poll_interval
                );
            }
        }

        info!("Poller for '{}' stopped", self.device);
        Ok(())
    }

    /// Run one cycle immediately.
    pub async fn poll_once(&self) -> CycleReport {
        let now = Utc::now();
        let mut report = CycleReport::default();
        let mut numeric: HashMap<String, f64> = HashMap::new();

        for block in &self.plan.blocks {
            match self
                .io
                .read_block(&self.device, block.address, block.count)
                .await
            {
                Ok(words) => {
                    report.blocks_ok += 1;
                    for (tag, reading) in self.plan.decode(block, &words, now) {
                        let key = tag.key();
                        if let Some(value) = reading.value.as_float() {
                            numeric.insert(key.clone(), value);
                        }
                        self.bus.publish(&self.device, &key, reading);
                        report.readings += 1;
                    }
                }
                Err(e) => {
                    report.blocks_failed += 1;
                    self.failed_blocks.fetch_add(1, Ordering::Relaxed);
                    if e.is_recoverable() {
                        debug!(
                            "No data this cycle for '{}' block {}+{}: {}",
                            self.device, block.address, block.count, e
                        );
                    } else {
                        warn!(
                            "Block read {}+{} on '{}' failed: {}",
                            block.address, block.count, self.device, e
                        );
                    }
                }
            }
        }

        for rule in self.rules.iter().filter(|r| r.enabled) {
            let Some(&value) = numeric.get(&rule.tag) else {
                debug!(
                    "Rule '{}' on '{}' skipped: no numeric value for '{}'",
                    rule.id, self.device, rule.tag
                );
                continue;
            };

            let evaluation = alarms::evaluate(rule, value, now);
            let observation = Observation::new(
                ALARM_SOURCE,
                format!("{}:{}", self.device, rule.id),
                evaluation.state,
                evaluation.message,
            )
            .with_value(value)
            .with_severity(rule.severity)
            .with_rule(rule.id.clone(), rule.tag.clone())
            .with_thresholds(rule.warning_threshold, rule.alarm_threshold)
            .with_meta("plc", self.device.clone())
            .with_meta("comparison", String::from(rule.comparison.clone()))
            .at(now);

            match self.alarms.set_state(observation) {
                Ok(transition) => {
                    report.evaluations += 1;
                    if transition.transitioned() {
                        report.transitions += 1;
                    }
                }
                Err(e) => {
                    self.alarm_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Failed to record alarm state for rule '{}' on '{}': {}",
                        rule.id, self.device, e
                    );
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// End the loop after the current cycle.
    pub fn stop(&self) {
        info!("Stopping poller for '{}'", self.device);
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn signal_bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            device: self.device.clone(),
            running: self.is_running(),
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_blocks: self.failed_blocks.load(Ordering::Relaxed),
            alarm_errors: self.alarm_errors.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
            tag_count: self.plan.tags.len(),
            block_count: self.plan.blocks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm_manager::MemoryAlarmStore;
    use crate::alarms::AlarmState;
    use crate::protocols::{Faults, MemoryTransport, RegisterBank};

    const DEVICE: &str = r#"
name: plc
host: sim
backoff_ms: 0
retries: 0
tags:
  tank:
    level: { address: 40011, type: INTEGER, raw_zero_scale: 0, raw_full_scale: 1000, eng_zero_scale: 0, eng_full_scale: 100 }
    pump: { address: 40012, type: DIGITAL, bits: { "BIT 0": RUNNING } }
alarm_rules:
  - { id: high, name: Tank high, tag: tank/level, warning_enabled: true, warning_threshold: 75, alarm_threshold: 90 }
  - { id: pump, name: Pump bits, tag: tank/pump, alarm_threshold: 0 }
"#;

    fn poller(bank: &RegisterBank) -> (Poller, Arc<AlarmManager>) {
        let device: DeviceConfig = serde_yaml::from_str(DEVICE).unwrap();
        let bank = bank.clone();
        let io = Arc::new(
            DeviceIoManager::with_transports(std::slice::from_ref(&device), move |_| {
                Box::new(MemoryTransport::new(bank.clone()))
            })
            .unwrap(),
        );
        let alarms = Arc::new(AlarmManager::new(Arc::new(MemoryAlarmStore::new())));
        let poller = Poller::new(
            &device,
            &ScanConfig::default(),
            io,
            SignalBus::new(),
            alarms.clone(),
        )
        .unwrap();
        (poller, alarms)
    }

    #[tokio::test]
    async fn test_cycle_publishes_and_evaluates() {
        let bank = RegisterBank::new();
        bank.set(11, 800); // 80.0 %
        bank.set(12, 1);
        let (poller, alarms) = poller(&bank);

        let report = poller.poll_once().await;
        assert_eq!(report.blocks_ok, 1);
        assert_eq!(report.readings, 2);
        // Digital tag has no numeric value, its rule is skipped
        assert_eq!(report.evaluations, 1);
        assert_eq!(report.transitions, 1);

        assert_eq!(poller.signal_bus().get_float("plc/tank/level").unwrap(), 80.0);
        let active = alarms.active_snapshot().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "plc:high");
        assert_eq!(active[0].source, ALARM_SOURCE);
        assert_eq!(active[0].state, AlarmState::Warning);

        bank.set(11, 100);
        let report = poller.poll_once().await;
        assert_eq!(report.transitions, 1);
        assert!(alarms.active_snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_device_is_no_data() {
        let bank = RegisterBank::new();
        bank.set_faults(Faults {
            refuse_connect: true,
            ..Faults::default()
        });
        let (poller, alarms) = poller(&bank);

        let report = poller.poll_once().await;
        assert_eq!(report.blocks_failed, 1);
        assert_eq!(report.evaluations, 0);
        assert!(alarms.history(10).unwrap().is_empty());
        assert_eq!(poller.stats().failed_blocks, 1);
        assert_eq!(poller.stats().cycles, 1);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let bank = RegisterBank::new();
        let (poller, _) = poller(&bank);
        let poller = Arc::new(poller);

        let handle = tokio::spawn({
            let poller = poller.clone();
            async move { poller.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(poller.is_running());
        assert!(poller.run().await.is_err());

        poller.stop();
        handle.await.unwrap().unwrap();
        assert!(!poller.is_running());
        assert!(poller.stats().cycles >= 1);
    }
}
