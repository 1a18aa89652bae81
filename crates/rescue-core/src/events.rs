//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow a restore or exit operation
//! without being coupled to the orchestrator.

use std::fmt;

use chrono::{DateTime, Local};

use crate::state::RestoreStage;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a recovery operation.
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// A stage is about to run.
    StageStarted {
        stage: RestoreStage,
        at: DateTime<Local>,
    },
    /// A stage finished, successfully or with an advisory.
    StageFinished {
        stage: RestoreStage,
        at: DateTime<Local>,
        note: Option<String>,
    },
    /// Overall progress, 0..=100.
    Progress { percent: u8 },
    /// Free-form log line.
    Log { level: LogLevel, message: String },
    /// A device was found on the bus.
    DeviceDetected { description: String },
    /// One exit strategy ran.
    StrategyAttempted {
        strategy: String,
        success: bool,
        reason: String,
    },
    /// The operation finished successfully.
    Completed,
    /// The operation failed at `stage`.
    Failed {
        stage: RestoreStage,
        reasons: Vec<String>,
    },
    /// The operation was cancelled at `stage`.
    Cancelled { stage: RestoreStage },
}

impl RecoveryEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        RecoveryEvent::Log {
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }
}

impl fmt::Display for RecoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryEvent::StageStarted { stage, at } => {
                write!(f, "[{}] >> {}", at.format("%H:%M:%S"), stage)
            }
            RecoveryEvent::StageFinished { stage, at, note } => {
                write!(f, "[{}] << {}", at.format("%H:%M:%S"), stage)?;
                if let Some(note) = note {
                    write!(f, " ({note})")?;
                }
                Ok(())
            }
            RecoveryEvent::Progress { percent } => write!(f, "{percent}%"),
            RecoveryEvent::Log { message, .. } => write!(f, "{message}"),
            RecoveryEvent::DeviceDetected { description } => {
                write!(f, "Device: {description}")
            }
            RecoveryEvent::StrategyAttempted {
                strategy,
                success,
                reason,
            } => {
                let mark = if *success { "ok" } else { "failed" };
                write!(f, "{strategy}: {mark} ({reason})")
            }
            RecoveryEvent::Completed => write!(f, "Completed"),
            RecoveryEvent::Failed { stage, reasons } => {
                write!(f, "Failed at {stage}")?;
                for reason in reasons {
                    write!(f, "\n  - {reason}")?;
                }
                Ok(())
            }
            RecoveryEvent::Cancelled { stage } => write!(f, "Cancelled at {stage}"),
        }
    }
}

/// Observer trait for receiving recovery events.
///
/// Implement this in the UI layer to receive updates.
pub trait RecoveryObserver: Send + Sync {
    fn on_event(&self, event: &RecoveryEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl RecoveryObserver for NullObserver {
    fn on_event(&self, _event: &RecoveryEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl RecoveryObserver for TracingObserver {
    fn on_event(&self, event: &RecoveryEvent) {
        match event {
            RecoveryEvent::StageStarted { stage, at } => {
                tracing::info!(stage = %stage, at = %at.format("%H:%M:%S%.3f"), "Stage started");
            }
            RecoveryEvent::StageFinished { stage, at, note } => match note {
                Some(note) => {
                    tracing::info!(stage = %stage, at = %at.format("%H:%M:%S%.3f"), note = %note, "Stage finished")
                }
                None => {
                    tracing::info!(stage = %stage, at = %at.format("%H:%M:%S%.3f"), "Stage finished")
                }
            },
            RecoveryEvent::Progress { percent } => {
                tracing::debug!(progress = %format!("{}%", percent), "Progress");
            }
            RecoveryEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            RecoveryEvent::DeviceDetected { description } => {
                tracing::info!(device = %description, "Device detected");
            }
            RecoveryEvent::StrategyAttempted {
                strategy,
                success,
                reason,
            } => {
                if *success {
                    tracing::info!(strategy = %strategy, "Exit strategy succeeded");
                } else {
                    tracing::warn!(strategy = %strategy, reason = %reason, "Exit strategy failed");
                }
            }
            RecoveryEvent::Completed => tracing::info!("Operation complete"),
            RecoveryEvent::Failed { stage, reasons } => {
                tracing::error!(stage = %stage, reasons = %reasons.join("; "), "Operation failed");
            }
            RecoveryEvent::Cancelled { stage } => {
                tracing::warn!(stage = %stage, "Operation cancelled");
            }
        }
    }
}

/// Observer that records every event, for tests and headless callers.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<RecoveryEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecoveryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl RecoveryObserver for RecordingObserver {
    fn on_event(&self, event: &RecoveryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
