//! rescue-core: Recovery/DFU device handling and restore orchestration for
//! Apple mobile devices.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: USB identifiers, endpoints and bootloader commands
//! - **Transport**: USB bus abstraction (nusb, mock)
//! - **Device**: enumeration and mode classification
//! - **Client**: the in-process iRecovery protocol session
//! - **Tools**: bundled `irecovery` and libimobiledevice invocations
//! - **Exit**: the exit-recovery strategy chain
//! - **Bundle**: IPSW reading and component extraction
//! - **TSS**: signing request/response negotiation
//! - **State**: restore stages, flash sequence and final handoff
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: the orchestrator tying everything together
//!
//! # Example
//!
//! ```no_run
//! use rescue_core::{Collaborators, RecoverySession, RestoreConfig};
//!
//! let config = RestoreConfig {
//!     archive: Some("iPhone_15.8_19H370_Restore.ipsw".into()),
//!     ..Default::default()
//! };
//!
//! let collaborators = Collaborators::system(&config).expect("HTTP client");
//! let session = RecoverySession::new(config, collaborators);
//! let run = session.start_restore().expect("no other operation running");
//! let state = run.join();
//! println!("{:?} at {}%", state.status, state.progress);
//! ```

pub mod bundle;
pub mod cancel;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod exit;
pub mod normal;
pub mod protocol;
pub mod session;
pub mod state;
pub mod tools;
pub mod transport;
pub mod tss;

// Re-exports for convenience
pub use bundle::{BundleError, BundleReader, Component, FirmwareBundle, IpswArchive, IpswInfo};
pub use cancel::{CancelToken, PollPolicy};
pub use client::{ClientSettings, ProtocolSession, RebootMethod, exit_recovery_mode};
pub use config::{RestoreConfig, TimingConfig};
pub use device::{DeviceDescriptor, find_recovery_devices, find_session_device, list_devices};
pub use error::{RecoveryError, Severity, StageOutcome};
pub use events::{
    LogLevel, NullObserver, RecordingObserver, RecoveryEvent, RecoveryObserver, TracingObserver,
};
pub use exit::{ExitChain, ExitReport, ExitStrategy, StrategyOutcome};
pub use normal::{DeviceIdentity, NoNormalMode, NormalModeProvider};
pub use protocol::DeviceMode;
pub use session::{Collaborators, RecoverySession, RestoreRun, operation_in_progress};
pub use state::{RestoreStage, RunState, RunStatus, SigningMode};
pub use tools::{IrecoveryCli, LibimobiledeviceProvider, RecoveryTool};
pub use transport::{MockBus, NusbBus, TransportError, UsbBus};
pub use tss::{SigningNegotiator, SigningOutcome, SigningRequest};
