//! Restore run state: stages, progress and terminal status.

use std::fmt;

/// Progress reported when a run starts.
pub const START_PROGRESS: u8 = 5;

/// Stages of a restore, in execution order, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreStage {
    ValidateBundle,
    DetectDevice,
    EnterRecovery,
    ExtractFirmware,
    NegotiateSigning,
    FlashBootloaders,
    LoadRamdiskAndKernel,
    PerformRestore,
    /// Standalone recovery exit, outside the restore sequence.
    ExitRecovery,
    Completed,
    Failed,
}

impl RestoreStage {
    /// The eight restore stages in order.
    pub const SEQUENCE: [RestoreStage; 8] = [
        RestoreStage::ValidateBundle,
        RestoreStage::DetectDevice,
        RestoreStage::EnterRecovery,
        RestoreStage::ExtractFirmware,
        RestoreStage::NegotiateSigning,
        RestoreStage::FlashBootloaders,
        RestoreStage::LoadRamdiskAndKernel,
        RestoreStage::PerformRestore,
    ];

    /// Progress checkpoint reached when this stage completes.
    pub const fn completion_progress(self) -> u8 {
        match self {
            RestoreStage::ValidateBundle => 10,
            RestoreStage::DetectDevice => 15,
            RestoreStage::EnterRecovery => 20,
            RestoreStage::ExtractFirmware => 30,
            RestoreStage::NegotiateSigning => 40,
            RestoreStage::FlashBootloaders => 55,
            RestoreStage::LoadRamdiskAndKernel => 70,
            RestoreStage::PerformRestore
            | RestoreStage::ExitRecovery
            | RestoreStage::Completed => 100,
            RestoreStage::Failed => 0,
        }
    }

    /// 1-based position in the restore sequence.
    pub fn step(self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|s| *s == self).map(|i| i + 1)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RestoreStage::Completed | RestoreStage::Failed)
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStage::ValidateBundle => write!(f, "Validate Bundle"),
            RestoreStage::DetectDevice => write!(f, "Detect Device"),
            RestoreStage::EnterRecovery => write!(f, "Enter Recovery"),
            RestoreStage::ExtractFirmware => write!(f, "Extract Firmware"),
            RestoreStage::NegotiateSigning => write!(f, "Negotiate Signing"),
            RestoreStage::FlashBootloaders => write!(f, "Flash Bootloaders"),
            RestoreStage::LoadRamdiskAndKernel => write!(f, "Load Ramdisk and Kernel"),
            RestoreStage::PerformRestore => write!(f, "Perform Restore"),
            RestoreStage::ExitRecovery => write!(f, "Exit Recovery"),
            RestoreStage::Completed => write!(f, "Completed"),
            RestoreStage::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    /// Stopped by a fatal error at `stage`.
    Failed { stage: RestoreStage, reasons: Vec<String> },
    Cancelled { stage: RestoreStage },
}

/// Observable state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub stage: RestoreStage,
    pub progress: u8,
    pub status: RunStatus,
    /// Advisories collected along the way.
    pub notes: Vec<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            stage: RestoreStage::ValidateBundle,
            progress: 0,
            status: RunStatus::Running,
            notes: Vec::new(),
        }
    }
}

impl RunState {
    /// Raise progress to `percent`; never lowers it, caps at 100.
    ///
    /// Returns `true` if the value changed.
    pub fn advance(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress && self.is_active() {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn enter(&mut self, stage: RestoreStage) {
        if self.is_active() {
            self.stage = stage;
        }
    }

    pub fn complete(&mut self) {
        if self.is_active() {
            self.progress = 100;
            self.stage = RestoreStage::Completed;
            self.status = RunStatus::Completed;
        }
    }

    /// Freeze at the current stage and progress.
    pub fn fail(&mut self, reasons: Vec<String>) {
        if self.is_active() {
            self.status = RunStatus::Failed {
                stage: self.stage,
                reasons,
            };
        }
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            self.status = RunStatus::Cancelled { stage: self.stage };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints_increase_along_sequence() {
        let mut last = START_PROGRESS;
        for stage in RestoreStage::SEQUENCE {
            assert!(stage.completion_progress() > last, "{stage}");
            last = stage.completion_progress();
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut state = RunState::default();
        assert!(state.advance(40));
        assert!(!state.advance(30));
        assert_eq!(state.progress, 40);
        assert!(state.advance(250));
        assert_eq!(state.progress, 100);
    }

    #[test]
    fn test_failure_freezes_state() {
        let mut state = RunState::default();
        state.advance(START_PROGRESS);
        state.enter(RestoreStage::ValidateBundle);
        state.fail(vec!["missing plists".into()]);

        assert!(!state.advance(50));
        state.enter(RestoreStage::DetectDevice);
        state.complete();

        assert_eq!(state.progress, START_PROGRESS);
        assert_eq!(
            state.status,
            RunStatus::Failed {
                stage: RestoreStage::ValidateBundle,
                reasons: vec!["missing plists".into()]
            }
        );
    }

    #[test]
    fn test_step_numbers() {
        assert_eq!(RestoreStage::ValidateBundle.step(), Some(1));
        assert_eq!(RestoreStage::PerformRestore.step(), Some(8));
        assert_eq!(RestoreStage::Completed.step(), None);
    }
}
