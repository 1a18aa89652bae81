//! Restore state machine and its stage helpers.

pub mod flash;
pub mod handoff;
pub mod machine;

pub use flash::{
    DeviceFlashBackend, FlashBackend, FlashError, FlashSequencer, FlashStep, LoadReport,
    SigningMode, load_ramdisk_and_kernel,
};
pub use handoff::{HandoffContext, ManualHandoff, RestoreHandoff};
pub use machine::{RestoreStage, RunState, RunStatus, START_PROGRESS};
