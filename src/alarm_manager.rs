// src/alarm_manager.rs - Alarm occurrences, transition events and acknowledgement
use crate::{
    alarms::{AlarmSeverity, AlarmState},
    error::{PlcError, Result, StoreError},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Retries of one read-modify-write after a store conflict.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The single live or most recent record of one `(source, key)` alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmOccurrence {
    pub id: u64,
    pub source: String,
    pub key: String,
    pub rule_id: Option<String>,
    pub tag: Option<String>,
    pub state: AlarmState,
    pub is_active: bool,
    pub severity: AlarmSeverity,
    pub message: String,
    pub value: Option<f64>,
    pub warning_threshold: Option<f64>,
    pub alarm_threshold: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub meta: BTreeMap<String, String>,
    /// Bumped by the store on every write
    pub version: u64,
}

/// Immutable record of one state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: u64,
    pub occurrence_id: u64,
    pub source: String,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    /// `None` for the event that created the occurrence
    pub prev_state: Option<AlarmState>,
    pub new_state: AlarmState,
    pub severity: AlarmSeverity,
    pub value: Option<f64>,
    pub message: String,
}

/// One evaluation result to fold into the occurrence for its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub source: String,
    pub key: String,
    pub state: AlarmState,
    pub severity: AlarmSeverity,
    pub message: String,
    pub value: Option<f64>,
    pub rule_id: Option<String>,
    pub tag: Option<String>,
    pub warning_threshold: Option<f64>,
    pub alarm_threshold: Option<f64>,
    pub meta: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        source: impl Into<String>,
        key: impl Into<String>,
        state: AlarmState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            state,
            severity: AlarmSeverity::default(),
            message: message.into(),
            value: None,
            rule_id: None,
            tag: None,
            warning_threshold: None,
            alarm_threshold: None,
            meta: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_severity(mut self, severity: AlarmSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>, tag: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self.tag = Some(tag.into());
        self
    }

    pub fn with_thresholds(mut self, warning: Option<f64>, alarm: Option<f64>) -> Self {
        self.warning_threshold = warning;
        self.alarm_threshold = alarm;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// What [`AlarmManager::set_state`] did with an observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// `None` when an OK observation met no occurrence
    pub occurrence_id: Option<u64>,
    pub created: bool,
    pub state: AlarmState,
    pub event: Option<AlarmEvent>,
}

impl Transition {
    pub fn transitioned(&self) -> bool {
        self.event.is_some()
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Persistence of occurrences and their events.
///
/// `(source, key)` is unique. `insert` and `update` write the occurrence and
/// its optional event atomically, assign ids and set `version`. `update`
/// rejects a stale `version` with [`StoreError::Conflict`].
pub trait AlarmStore: Send + Sync {
    fn find(&self, source: &str, key: &str) -> std::result::Result<Option<AlarmOccurrence>, StoreError>;

    fn get(&self, id: u64) -> std::result::Result<Option<AlarmOccurrence>, StoreError>;

    fn insert(
        &self,
        occurrence: AlarmOccurrence,
        event: AlarmEvent,
    ) -> std::result::Result<(AlarmOccurrence, AlarmEvent), StoreError>;

    fn update(
        &self,
        occurrence: AlarmOccurrence,
        event: Option<AlarmEvent>,
    ) -> std::result::Result<(AlarmOccurrence, Option<AlarmEvent>), StoreError>;

    fn active(&self) -> std::result::Result<Vec<AlarmOccurrence>, StoreError>;

    fn events_for(&self, occurrence_id: u64) -> std::result::Result<Vec<AlarmEvent>, StoreError>;

    /// Latest `limit` events in chronological order.
    fn recent_events(&self, limit: usize) -> std::result::Result<Vec<AlarmEvent>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    occurrences: HashMap<u64, AlarmOccurrence>,
    by_key: HashMap<(String, String), u64>,
    events: Vec<AlarmEvent>,
    next_occurrence_id: u64,
    next_event_id: u64,
}

impl MemoryInner {
    fn append_event(&mut self, mut event: AlarmEvent, occurrence_id: u64) -> AlarmEvent {
        self.next_event_id += 1;
        event.id = self.next_event_id;
        event.occurrence_id = occurrence_id;
        self.events.push(event.clone());
        event
    }
}

/// In-process [`AlarmStore`].
#[derive(Default)]
pub struct MemoryAlarmStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occurrence_count(&self) -> usize {
        self.inner.read().occurrences.len()
    }
}

impl AlarmStore for MemoryAlarmStore {
    fn find(&self, source: &str, key: &str) -> std::result::Result<Option<AlarmOccurrence>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .by_key
            .get(&(source.to_string(), key.to_string()))
            .and_then(|id| inner.occurrences.get(id))
            .cloned())
    }

    fn get(&self, id: u64) -> std::result::Result<Option<AlarmOccurrence>, StoreError> {
        Ok(self.inner.read().occurrences.get(&id).cloned())
    }

    fn insert(
        &self,
        mut occurrence: AlarmOccurrence,
        event: AlarmEvent,
    ) -> std::result::Result<(AlarmOccurrence, AlarmEvent), StoreError> {
        let mut inner = self.inner.write();
        let unique = (occurrence.source.clone(), occurrence.key.clone());
        if inner.by_key.contains_key(&unique) {
            return Err(StoreError::Conflict {
                origin: occurrence.source,
                key: occurrence.key,
            });
        }

        inner.next_occurrence_id += 1;
        occurrence.id = inner.next_occurrence_id;
        occurrence.version = 1;
        inner.by_key.insert(unique, occurrence.id);
        inner.occurrences.insert(occurrence.id, occurrence.clone());
        let event = inner.append_event(event, occurrence.id);
        Ok((occurrence, event))
    }

    fn update(
        &self,
        mut occurrence: AlarmOccurrence,
        event: Option<AlarmEvent>,
    ) -> std::result::Result<(AlarmOccurrence, Option<AlarmEvent>), StoreError> {
        let mut inner = self.inner.write();
        let stored_version = inner
            .occurrences
            .get(&occurrence.id)
            .map(|o| o.version)
            .ok_or(StoreError::NotFound(occurrence.id))?;
        if stored_version != occurrence.version {
            return Err(StoreError::Conflict {
                origin: occurrence.source,
                key: occurrence.key,
            });
        }

        occurrence.version += 1;
        inner.occurrences.insert(occurrence.id, occurrence.clone());
        let event = event.map(|e| inner.append_event(e, occurrence.id));
        Ok((occurrence, event))
    }

    fn active(&self) -> std::result::Result<Vec<AlarmOccurrence>, StoreError> {
        Ok(self
            .inner
            .read()
            .occurrences
            .values()
            .filter(|o| o.is_active)
            .cloned()
            .collect())
    }

    fn events_for(&self, occurrence_id: u64) -> std::result::Result<Vec<AlarmEvent>, StoreError> {
        Ok(self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.occurrence_id == occurrence_id)
            .cloned()
            .collect())
    }

    fn recent_events(&self, limit: usize) -> std::result::Result<Vec<AlarmEvent>, StoreError> {
        let inner = self.inner.read();
        let start = inner.events.len().saturating_sub(limit);
        Ok(inner.events[start..].to_vec())
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Stable dedupe key for sources that have none: sha256 of `source|raw`.
pub fn stable_key(source: &str, raw: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", source, raw).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Sole writer of alarm occurrence state.
pub struct AlarmManager {
    store: Arc<dyn AlarmStore>,
    max_conflict_retries: u32,
    events_tx: broadcast::Sender<AlarmEvent>,
}

impl AlarmManager {
    pub fn new(store: Arc<dyn AlarmStore>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
            events_tx,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Transition events as they are committed.
    pub fn subscribe(&self) -> broadcast::Receiver<AlarmEvent> {
        self.events_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.store
    }

    /// Fold one observation into the occurrence for its `(source, key)`.
    ///
    /// OK never creates an occurrence. An event is appended only when the
    /// state changes. Store conflicts rerun the whole read-modify-write.
    pub fn set_state(&self, observation: Observation) -> Result<Transition> {
        let mut observation = observation;
        observation.source = observation.source.trim().to_string();
        if observation.source.is_empty() {
            observation.source = "unknown".to_string();
        }
        observation.key = observation.key.trim().to_string();
        if observation.key.is_empty() {
            observation.key = stable_key(&observation.source, &observation.message);
        }

        let transition = self.with_conflict_retry(&observation.source, &observation.key, || {
            self.apply(&observation)
        })?;

        if let Some(event) = &transition.event {
            // No subscribers is fine
            let _ = self.events_tx.send(event.clone());
        }
        Ok(transition)
    }

    fn apply(&self, obs: &Observation) -> std::result::Result<Transition, StoreError> {
        let ts = obs.timestamp;

        let Some(mut occ) = self.store.find(&obs.source, &obs.key)? else {
            if !obs.state.is_active() {
                return Ok(Transition {
                    occurrence_id: None,
                    created: false,
                    state: AlarmState::Ok,
                    event: None,
                });
            }

            let occurrence = AlarmOccurrence {
                id: 0,
                source: obs.source.clone(),
                key: obs.key.clone(),
                rule_id: obs.rule_id.clone(),
                tag: obs.tag.clone(),
                state: obs.state,
                is_active: true,
                severity: obs.severity,
                message: obs.message.clone(),
                value: obs.value,
                warning_threshold: obs.warning_threshold,
                alarm_threshold: obs.alarm_threshold,
                first_seen_at: ts,
                last_seen_at: ts,
                cleared_at: None,
                acknowledged: false,
                acknowledged_at: None,
                acknowledged_by: None,
                meta: obs.meta.clone(),
                version: 0,
            };
            let event = event_for(&occurrence, None, obs);
            let (occ, event) = self.store.insert(occurrence, event)?;
            info!(
                "Alarm {} raised: ({}, {}) {}",
                occ.state, occ.source, occ.key, occ.message
            );
            return Ok(Transition {
                occurrence_id: Some(occ.id),
                created: true,
                state: occ.state,
                event: Some(event),
            });
        };

        let prev = occ.state;
        occ.last_seen_at = ts;
        occ.value = obs.value;
        occ.severity = obs.severity;
        occ.warning_threshold = obs.warning_threshold;
        occ.alarm_threshold = obs.alarm_threshold;
        if !obs.message.is_empty() {
            occ.message = obs.message.clone();
        }
        if obs.rule_id.is_some() {
            occ.rule_id = obs.rule_id.clone();
        }
        if obs.tag.is_some() {
            occ.tag = obs.tag.clone();
        }
        occ.meta.extend(obs.meta.iter().map(|(k, v)| (k.clone(), v.clone())));

        let event = if prev != obs.state {
            occ.state = obs.state;
            occ.is_active = obs.state.is_active();
            occ.cleared_at = if obs.state.is_active() { None } else { Some(ts) };
            Some(event_for(&occ, Some(prev), obs))
        } else {
            None
        };

        let (occ, event) = self.store.update(occ, event)?;
        if event.is_some() {
            info!(
                "Alarm ({}, {}) {} -> {}",
                occ.source, occ.key, prev, occ.state
            );
        }
        Ok(Transition {
            occurrence_id: Some(occ.id),
            created: false,
            state: occ.state,
            event,
        })
    }

    /// Mark an occurrence acknowledged. State and later transitions leave it set.
    pub fn acknowledge(
        &self,
        occurrence_id: u64,
        acknowledged_by: &str,
        note: Option<&str>,
    ) -> Result<AlarmOccurrence> {
        let origin = occurrence_id.to_string();
        self.with_conflict_retry("ack", &origin, || {
            let mut occ = self
                .store
                .get(occurrence_id)?
                .ok_or(StoreError::NotFound(occurrence_id))?;
            occ.acknowledged = true;
            occ.acknowledged_at = Some(Utc::now());
            occ.acknowledged_by = Some(acknowledged_by.to_string());
            if let Some(note) = note.filter(|n| !n.is_empty()) {
                occ.meta.insert("ack_note".to_string(), note.to_string());
            }
            let (occ, _) = self.store.update(occ, None)?;
            info!("Alarm occurrence {} acknowledged by {}", occ.id, acknowledged_by);
            Ok(occ)
        })
        .map_err(|e| match e {
            PlcError::Store(StoreError::NotFound(id)) => {
                PlcError::NotFound(format!("alarm occurrence {}", id))
            }
            other => other,
        })
    }

    /// Active occurrences, most recently seen first.
    pub fn active_snapshot(&self) -> Result<Vec<AlarmOccurrence>> {
        let mut active = self.store.active()?;
        active.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then(b.id.cmp(&a.id)));
        Ok(active)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<AlarmEvent>> {
        Ok(self.store.recent_events(limit)?)
    }

    pub fn events_for(&self, occurrence_id: u64) -> Result<Vec<AlarmEvent>> {
        Ok(self.store.events_for(occurrence_id)?)
    }

    fn with_conflict_retry<T>(
        &self,
        source: &str,
        key: &str,
        mut op: impl FnMut() -> std::result::Result<T, StoreError>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(StoreError::Conflict { .. }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!("Alarm store conflict on ({}, {}), retry {}", source, key, attempt);
                }
                Err(e) => {
                    warn!("Alarm store write failed for ({}, {}): {}", source, key, e);
                    return Err(e.into());
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

fn event_for(occ: &AlarmOccurrence, prev_state: Option<AlarmState>, obs: &Observation) -> AlarmEvent {
    AlarmEvent {
        id: 0,
        occurrence_id: occ.id,
        source: occ.source.clone(),
        key: occ.key.clone(),
        timestamp: obs.timestamp,
        prev_state,
        new_state: obs.state,
        severity: occ.severity,
        value: obs.value,
        message: if obs.message.is_empty() {
            occ.message.clone()
        } else {
            obs.message.clone()
        },
    }
}
