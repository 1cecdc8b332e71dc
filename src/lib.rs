//! regscan - PLC register scanning and alarm lifecycle
//!
//! Reads tag trees from YAML, packs the tags of every device into a minimal
//! set of holding-register block reads, polls them through a per-device I/O
//! manager with retries and verified bit writes, and turns the decoded values
//! into alarm occurrences with an auditable event history.
//!
//! # Examples
//!
//! ```rust
//! use regscan::{Config, ScanPlan};
//!
//! let config = Config::from_yaml(r#"
//! devices:
//!   - name: main_plc
//!     host: 10.0.0.5
//!     tags:
//!       boiler:
//!         pressure: { address: 40011, type: REAL }
//!         burner: { address: 40014, type: INTEGER }
//! "#)?;
//!
//! let device = config.device("main_plc").unwrap();
//! let plan = ScanPlan::build(&device.tags, &config.scan)?;
//! assert_eq!(plan.blocks.len(), 1);
//! assert_eq!(plan.blocks[0].count, 3);
//! # Ok::<(), regscan::PlcError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error types shared by every module
pub mod error;

/// Decoded tag values, scaling and register decoding
pub mod value;

/// YAML configuration of scan settings, devices, tags and alarm rules
pub mod config;

/// Tag tree flattening and block read planning
pub mod scan_plan;

/// Latest reading of every tag
pub mod signal;

// ============================================================================
// DEVICE I/O
// ============================================================================

/// Register transports (Modbus TCP and an in-memory simulator)
pub mod protocols;

/// Per-device serialized I/O with retries and verified bit writes
pub mod device;

// ============================================================================
// ALARMS
// ============================================================================

/// Alarm rules and threshold evaluation
pub mod alarms;

/// Alarm occurrences, events and acknowledgement
pub mod alarm_manager;

// ============================================================================
// RUNTIME
// ============================================================================

/// Per-device polling loop
pub mod engine;

/// Build metadata
pub mod build_info;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alarm_manager::{AlarmManager, AlarmStore, MemoryAlarmStore, Observation};
pub use alarms::{AlarmRule, AlarmSeverity, AlarmState};
pub use config::{Config, DeviceConfig, ScanConfig};
pub use device::DeviceIoManager;
pub use engine::Poller;
pub use error::{DeviceError, PlcError, Result};
pub use scan_plan::{ReadBlock, ScanPlan, TagSpec};
pub use signal::SignalBus;
pub use value::Value;

/// regscan version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
