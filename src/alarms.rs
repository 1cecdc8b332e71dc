// File: src/alarms.rs
// Threshold, range and schedule evaluation of alarm rules.
//
// Evaluation is instantaneous and stateless: the same rule, value and clock
// always give the same state. Lifecycle and deduplication live in
// `alarm_manager`.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

// ==========================================
// SECTION 1: STATES AND SEVERITIES
// ==========================================

/// Output of rule evaluation and state of an alarm occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlarmState {
    Ok,
    Warning,
    Alarm,
}

impl AlarmState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Ok => "OK",
            AlarmState::Warning => "WARNING",
            AlarmState::Alarm => "ALARM",
        }
    }

    pub fn is_active(self) -> bool {
        self != AlarmState::Ok
    }
}

/// Unrecognized state names read as `Ok`.
impl From<&str> for AlarmState {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ALARM" => AlarmState::Alarm,
            "WARNING" => AlarmState::Warning,
            _ => AlarmState::Ok,
        }
    }
}

impl From<String> for AlarmState {
    fn from(raw: String) -> Self {
        AlarmState::from(raw.as_str())
    }
}

impl From<AlarmState> for String {
    fn from(state: AlarmState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSeverity {
    Info = 1,
    #[default]
    Warning = 2,
    Critical = 3,
    Emergency = 4,
}

// ==========================================
// SECTION 2: RULE DEFINITIONS
// ==========================================

/// How a rule compares the value against its thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Comparison {
    Above,
    Below,
    OutsideRange,
    InsideRange,
    /// Kept so one bad rule evaluates to OK instead of failing the config
    Unsupported(String),
}

impl Default for Comparison {
    fn default() -> Self {
        Comparison::Above
    }
}

impl From<String> for Comparison {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "above" => Comparison::Above,
            "below" => Comparison::Below,
            "outside_range" => Comparison::OutsideRange,
            "inside_range" => Comparison::InsideRange,
            _ => Comparison::Unsupported(raw),
        }
    }
}

impl From<Comparison> for String {
    fn from(comparison: Comparison) -> Self {
        match comparison {
            Comparison::Above => "above".to_string(),
            Comparison::Below => "below".to_string(),
            Comparison::OutsideRange => "outside_range".to_string(),
            Comparison::InsideRange => "inside_range".to_string(),
            Comparison::Unsupported(raw) => raw,
        }
    }
}

/// Local time-of-day window restricting when a rule is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,

    /// `HH:MM` or `HH:MM:SS`, inclusive
    #[serde(default, with = "time_of_day")]
    pub start: Option<NaiveTime>,

    /// `HH:MM` or `HH:MM:SS`, exclusive
    #[serde(default, with = "time_of_day")]
    pub end: Option<NaiveTime>,

    /// IANA zone name, UTC when missing or unknown
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: String,
    pub name: String,

    /// Tag path inside the device's tag tree, joined with `/`
    pub tag: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub severity: AlarmSeverity,

    #[serde(default)]
    pub comparison: Comparison,

    #[serde(default)]
    pub warning_enabled: bool,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub alarm_threshold: Option<f64>,

    #[serde(default)]
    pub warning_low: Option<f64>,
    #[serde(default)]
    pub warning_high: Option<f64>,
    #[serde(default)]
    pub alarm_low: Option<f64>,
    #[serde(default)]
    pub alarm_high: Option<f64>,

    #[serde(default)]
    pub schedule: Schedule,
}

fn default_true() -> bool {
    true
}

mod time_of_day {
    use chrono::NaiveTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => serializer.serialize_str(&t.format("%H:%M:%S").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid time of day '{}'", s))),
        }
    }
}

// ==========================================
// SECTION 3: EVALUATION
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub state: AlarmState,
    pub message: String,
}

impl Evaluation {
    fn new(state: AlarmState, message: String) -> Self {
        Self { state, message }
    }
}

/// Whether a rule with `schedule` should be evaluated at `now`.
///
/// A disabled or incomplete schedule is always active. `start == end` is the
/// whole day; `start > end` wraps midnight.
pub fn is_rule_active(now: DateTime<Utc>, schedule: &Schedule) -> bool {
    if !schedule.enabled {
        return true;
    }
    let (Some(start), Some(end)) = (schedule.start, schedule.end) else {
        return true;
    };
    if start == end {
        return true;
    }

    let local = local_time(now, schedule.timezone.as_deref());
    if start < end {
        start <= local && local < end
    } else {
        local >= start || local < end
    }
}

fn local_time(now: DateTime<Utc>, timezone: Option<&str>) -> NaiveTime {
    match timezone.map(|name| name.parse::<chrono_tz::Tz>()) {
        Some(Ok(tz)) => now.with_timezone(&tz).time(),
        Some(Err(_)) => {
            debug!("Unknown timezone {:?}, using UTC", timezone);
            now.time()
        }
        None => now.time(),
    }
}

/// Classify `value` against `rule` at `now`.
pub fn evaluate(rule: &AlarmRule, value: f64, now: DateTime<Utc>) -> Evaluation {
    if !is_rule_active(now, &rule.schedule) {
        return Evaluation::new(
            AlarmState::Ok,
            format!("Rule {} inactive (schedule) -> OK", rule.name),
        );
    }
    evaluate_thresholds(rule, value)
}

/// Threshold part of [`evaluate`], ignoring the schedule.
pub fn evaluate_thresholds(rule: &AlarmRule, value: f64) -> Evaluation {
    let name = &rule.name;
    let hit = |state: AlarmState| Evaluation::new(state, format!("Rule {} -> {}", name, state));

    match &rule.comparison {
        Comparison::Above | Comparison::Below => {
            let Some(alarm) = rule.alarm_threshold else {
                return Evaluation::new(AlarmState::Ok, format!("Rule {}: no alarm threshold", name));
            };
            let crosses = |threshold: f64| match rule.comparison {
                Comparison::Below => value <= threshold,
                _ => value >= threshold,
            };

            if crosses(alarm) {
                return hit(AlarmState::Alarm);
            }
            if rule.warning_enabled && rule.warning_threshold.is_some_and(crosses) {
                return hit(AlarmState::Warning);
            }
            hit(AlarmState::Ok)
        }
        Comparison::OutsideRange | Comparison::InsideRange => {
            let (Some(low), Some(high)) = (rule.alarm_low, rule.alarm_high) else {
                return Evaluation::new(AlarmState::Ok, format!("Rule {}: no alarm range", name));
            };
            let outside = rule.comparison == Comparison::OutsideRange;
            let in_band = |lo: f64, hi: f64| {
                let inside = lo <= value && value <= hi;
                if outside {
                    !inside
                } else {
                    inside
                }
            };

            if in_band(low, high) {
                return hit(AlarmState::Alarm);
            }
            if rule.warning_enabled {
                if let (Some(lo), Some(hi)) = (rule.warning_low, rule.warning_high) {
                    if in_band(lo, hi) {
                        return hit(AlarmState::Warning);
                    }
                }
            }
            hit(AlarmState::Ok)
        }
        Comparison::Unsupported(_) => Evaluation::new(
            AlarmState::Ok,
            format!("Rule {}: unsupported comparison", name),
        ),
    }
}
