// src/signal.rs - Latest decoded reading per tag
use crate::{
    error::{PlcError, Result},
    value::{Reading, Value},
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Thread-safe store of the most recent reading of every tag.
///
/// Keys are `"<device>/<tag path joined by '/'>"`. Pollers write, any number
/// of readers (displays, historians) read concurrently.
///
/// ```rust
/// use regscan::{SignalBus, Value};
/// use regscan::value::Reading;
///
/// let bus = SignalBus::new();
/// bus.publish("main_plc", "comp_1/suction", Reading {
///     value: Value::Float(2.5),
///     raw: vec![0x4020, 0x0000],
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(bus.get_float("main_plc/comp_1/suction")?, 2.5);
/// # Ok::<(), regscan::PlcError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    signals: Arc<DashMap<String, Reading>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(device: &str, tag_key: &str) -> String {
        format!("{}/{}", device, tag_key)
    }

    /// Store the reading of `tag_key` on `device`, replacing the previous one.
    pub fn publish(&self, device: &str, tag_key: &str, reading: Reading) {
        let key = Self::key(device, tag_key);
        trace!("Publishing {} = {}", key, reading.value);
        self.signals.insert(key, reading);
    }

    pub fn get(&self, key: &str) -> Option<Reading> {
        self.signals.get(key).map(|entry| entry.value().clone())
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.signals.get(key).map(|entry| entry.value().value.clone())
    }

    /// Numeric value of a signal.
    pub fn get_float(&self, key: &str) -> Result<f64> {
        match self.get_value(key) {
            Some(value) => value.as_float().ok_or_else(|| {
                PlcError::Config(format!(
                    "Signal '{}' is {} and has no numeric value",
                    key,
                    value.type_name()
                ))
            }),
            None => Err(PlcError::NotFound(format!("signal '{}'", key))),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.signals.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn signal_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.signals.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Readings of one device, keyed by tag path.
    pub fn device_snapshot(&self, device: &str) -> HashMap<String, Reading> {
        let prefix = format!("{}/", device);
        self.signals
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(&prefix)
                    .map(|tag| (tag.to_string(), entry.value().clone()))
            })
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<String, Reading> {
        self.signals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
