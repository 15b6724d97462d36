//! Barrier Event Logging
//!
//! Structured record of barrier state changes, useful for:
//! - Debugging arm/disarm races
//! - Auditing which methods were made not entrant and why they trapped
//! - Checking epoch progress in stress runs
//!
//! Every logged event is also forwarded to the `log` facade at the level
//! below, so an application's logger sees it even when console echo is off.
//!
//! Log Levels:
//! - ERROR: verification failures
//! - INFO: not-entrant transitions, deoptimizations, global arming
//! - DEBUG: arm, disarm, epoch bumps
//! - TRACE: slow-path entries

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Log level for barrier events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn as_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Barrier event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BarrierEvent {
    /// Guard set to the armed sentinel
    Armed { method: u64 },

    /// Guard set to a disarmed phase
    Disarmed { method: u64, value: u32, epoch: u64 },

    /// Method permanently trapped
    NotEntrant { method: u64 },

    /// Phase advanced, arming every method at once
    ArmedAll { phase: u32, threads: usize },

    /// Patching epoch bumped ahead of a disarm
    EpochAdvanced { epoch: u64 },

    /// A thread took the slow path
    SlowPathEntry { method: u64, thread: usize, guard: u32 },

    /// Trapped activation redirected to the resolution stub
    Deoptimized {
        method: u64,
        sender_sp: usize,
        resume_pc: usize,
    },

    /// Barrier bytes did not match the codec template
    VerificationFailed {
        method: u64,
        address: usize,
        message: String,
    },
}

impl BarrierEvent {
    /// Log level for event
    pub fn level(&self) -> LogLevel {
        match self {
            BarrierEvent::VerificationFailed { .. } => LogLevel::Error,
            BarrierEvent::NotEntrant { .. }
            | BarrierEvent::Deoptimized { .. }
            | BarrierEvent::ArmedAll { .. } => LogLevel::Info,
            BarrierEvent::Armed { .. }
            | BarrierEvent::Disarmed { .. }
            | BarrierEvent::EpochAdvanced { .. } => LogLevel::Debug,
            BarrierEvent::SlowPathEntry { .. } => LogLevel::Trace,
        }
    }

    /// Human-readable one-line form
    pub fn describe(&self) -> String {
        match self {
            BarrierEvent::Armed { method } => format!("[NMB] method {} armed", method),
            BarrierEvent::Disarmed {
                method,
                value,
                epoch,
            } => format!(
                "[NMB] method {} disarmed (guard {}, epoch {})",
                method, value, epoch
            ),
            BarrierEvent::NotEntrant { method } => {
                format!("[NMB] method {} made not entrant", method)
            }
            BarrierEvent::ArmedAll { phase, threads } => format!(
                "[NMB] all methods armed, phase {} published to {} threads",
                phase, threads
            ),
            BarrierEvent::EpochAdvanced { epoch } => {
                format!("[NMB] patching epoch advanced to {}", epoch)
            }
            BarrierEvent::SlowPathEntry {
                method,
                thread,
                guard,
            } => format!(
                "[NMB] thread {} entered slow path of method {} (guard {:#x})",
                thread, method, guard
            ),
            BarrierEvent::Deoptimized {
                method,
                sender_sp,
                resume_pc,
            } => format!(
                "[NMB] method {} deoptimized: sender sp {:#x}, caller pc {:#x}",
                method, sender_sp, resume_pc
            ),
            BarrierEvent::VerificationFailed {
                method,
                address,
                message,
            } => format!(
                "[NMB] barrier of method {} at {:#x} failed verification: {}",
                method, address, message
            ),
        }
    }
}

/// Barrier logger configuration
#[derive(Debug, Clone)]
pub struct BarrierLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Echo events to stdout
    pub console: bool,

    /// Echo as JSON instead of text
    pub json: bool,

    /// Prefix echoed events with a wall-clock timestamp
    pub timestamps: bool,

    /// Events retained in memory; the oldest are dropped first
    pub capacity: usize,
}

impl Default for BarrierLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            capacity: 4096,
        }
    }
}

/// Barrier Logger - in-memory structured event log
pub struct BarrierLogger {
    config: BarrierLoggerConfig,
    events: Mutex<VecDeque<(Instant, BarrierEvent)>>,
    enabled: AtomicBool,
}

impl BarrierLogger {
    pub fn new(config: BarrierLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a barrier event
    pub fn log(&self, event: BarrierEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = event.level();
        if level > self.config.level {
            return;
        }

        log::log!(level.as_log(), "{}", event.describe());

        if self.config.console {
            self.output_console(&event);
        }

        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.config.capacity {
                events.pop_front();
            }
            if self.config.capacity > 0 {
                events.push_back((Instant::now(), event));
            }
        }
    }

    fn output_console(&self, event: &BarrierEvent) {
        if self.config.timestamps {
            let now = chrono::Local::now();
            print!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
        }

        if self.config.json {
            if let Ok(json) = serde_json::to_string(event) {
                println!("{}", json);
            }
        } else {
            println!("{}", event.describe());
        }
    }

    /// Get all retained events
    pub fn events(&self) -> Vec<(Instant, BarrierEvent)> {
        if let Ok(events) = self.events.lock() {
            events.iter().cloned().collect()
        } else {
            Vec::new()
        }
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn event_count(&self) -> usize {
        if let Ok(events) = self.events.lock() {
            events.len()
        } else {
            0
        }
    }
}

impl Default for BarrierLogger {
    fn default() -> Self {
        Self::new(BarrierLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<BarrierLogger> = Mutex::new(BarrierLogger::default());
}

/// Log a barrier event to the global logger
pub fn log_event(event: BarrierEvent) {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.log(event);
    }
}

/// Replace the global logger
pub fn configure_logger(config: BarrierLoggerConfig) {
    if let Ok(mut logger) = GLOBAL_LOGGER.lock() {
        *logger = BarrierLogger::new(config);
    }
}

/// Events retained by the global logger
pub fn global_events() -> Vec<BarrierEvent> {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.events().into_iter().map(|(_, e)| e).collect()
    } else {
        Vec::new()
    }
}

/// Get global logger event count
pub fn get_event_count() -> usize {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.event_count()
    } else {
        0
    }
}
