//! Recovery session - the restore orchestrator and the standalone
//! enter/exit operations.
//!
//! One operation runs at a time per process, whichever session started it.
//! A restore runs on its own worker thread and is followed through
//! [`RestoreRun`] and the observer; enter and exit run on the caller's thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use crate::bundle::{BundleReader, Component, FirmwareBundle, IpswArchive, IpswInfo};
use crate::cancel::{CancelToken, PollPolicy};
use crate::config::RestoreConfig;
use crate::device::{DeviceDescriptor, find_recovery_devices, find_session_device};
use crate::error::{RecoveryError, StageOutcome};
use crate::events::{RecoveryEvent, RecoveryObserver, TracingObserver};
use crate::exit::{
    ExitChain, ExitReport, NativeApiStrategy, NativeRecoveryApi, ProtocolClientStrategy,
    RawControlStrategy, ToolAutoBootStrategy, UnavailableNativeApi,
};
use crate::normal::{DeviceIdentity, NormalModeProvider};
use crate::state::{
    DeviceFlashBackend, HandoffContext, RestoreHandoff, RestoreStage, RunState, START_PROGRESS,
    SigningMode, load_ramdisk_and_kernel,
};
use crate::tools::irecovery::IRECOVERY_TIMEOUT;
use crate::tools::{
    ExternalTool, IrecoveryCli, LibimobiledeviceProvider, RecoveryIdentity, RecoveryTool,
};
use crate::transport::{NusbBus, UsbBus};
use crate::tss::{
    ReqwestTransport, SigningError, SigningNegotiator, SigningOutcome, SigningRequest,
    SigningTransport,
};

/// Everything a session talks to outside the process.
pub struct Collaborators {
    pub bus: Arc<dyn UsbBus>,
    pub normal: Arc<dyn NormalModeProvider>,
    /// Bundled recovery tool; the in-process USB client is used without it.
    pub tool: Option<Arc<dyn RecoveryTool>>,
    pub signing: Arc<dyn SigningTransport>,
    pub native: Arc<dyn NativeRecoveryApi>,
    pub handoff: Arc<dyn RestoreHandoff>,
}

impl Collaborators {
    /// The real USB bus, external tools and signing service.
    pub fn system(config: &RestoreConfig) -> Result<Self, SigningError> {
        let tool = match &config.irecovery_path {
            Some(path) => IrecoveryCli::new(ExternalTool::new(path.clone(), IRECOVERY_TIMEOUT)),
            None => IrecoveryCli::locate(config.tool_dir.as_deref()),
        };

        Ok(Self {
            bus: Arc::new(NusbBus::new()),
            normal: Arc::new(LibimobiledeviceProvider::locate(config.tool_dir.as_deref())),
            tool: Some(Arc::new(tool)),
            signing: Arc::new(ReqwestTransport::new()?),
            native: Arc::new(UnavailableNativeApi),
            handoff: Arc::new(config.timing.handoff()),
        })
    }

    fn available_tool(&self) -> Option<&dyn RecoveryTool> {
        self.tool.as_deref().filter(|tool| tool.is_available())
    }
}

/// Set while a restore, enter or exit operation runs anywhere in the process.
static OPERATION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held while an operation runs; frees the process-wide slot on drop.
struct OperationGuard(());

impl OperationGuard {
    fn acquire() -> Result<Self, RecoveryError> {
        OPERATION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RecoveryError::Busy)?;
        Ok(Self(()))
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        OPERATION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// A restore, enter or exit operation is running in this process.
pub fn operation_in_progress() -> bool {
    OPERATION_ACTIVE.load(Ordering::SeqCst)
}

/// Entry point for restore, enter-recovery and exit-recovery operations.
pub struct RecoverySession<O: RecoveryObserver> {
    config: RestoreConfig,
    collaborators: Arc<Collaborators>,
    observer: Arc<O>,
}

impl RecoverySession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: RestoreConfig, collaborators: Collaborators) -> Self {
        Self::with_observer(config, collaborators, Arc::new(TracingObserver))
    }
}

impl<O: RecoveryObserver + 'static> RecoverySession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: RestoreConfig,
        collaborators: Collaborators,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            collaborators: Arc::new(collaborators),
            observer,
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// An operation is in progress, from this session or any other.
    pub fn is_busy(&self) -> bool {
        operation_in_progress()
    }

    /// Start the eight-stage restore on a worker thread.
    ///
    /// Fails with [`RecoveryError::Busy`] while another operation runs;
    /// nothing is queued.
    pub fn start_restore(&self) -> Result<RestoreRun, RecoveryError> {
        let guard = OperationGuard::acquire()?;

        let state = Arc::new(Mutex::new(RunState::default()));
        let cancel = CancelToken::new();
        let worker = RestoreWorker {
            config: self.config.clone(),
            collaborators: Arc::clone(&self.collaborators),
            observer: Arc::clone(&self.observer),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };

        let handle = thread::spawn(move || {
            let _guard = guard;
            worker.run();
        });

        Ok(RestoreRun {
            state,
            cancel,
            handle: Some(handle),
        })
    }

    /// The exit strategies in priority order.
    pub fn exit_chain(&self) -> ExitChain {
        let timing = &self.config.timing;
        let c = &self.collaborators;
        ExitChain::new()
            .with(NativeApiStrategy::new(
                Arc::clone(&c.native),
                timing.native_wait_policy(),
            ))
            .with(ToolAutoBootStrategy::new(c.tool.clone()))
            .with(ProtocolClientStrategy::new(
                Arc::clone(&c.bus),
                timing.client_settings(),
            ))
            .with(RawControlStrategy::new(Arc::clone(&c.bus)))
    }

    /// Boot a recovery-mode device back into its OS.
    ///
    /// The returned report carries every attempt; a failed chain is not an
    /// `Err`.
    #[instrument(skip_all)]
    pub fn exit_recovery(&self, cancel: &CancelToken) -> Result<ExitReport, RecoveryError> {
        let _guard = OperationGuard::acquire()?;
        let stage = RestoreStage::ExitRecovery;
        self.observer.on_event(&RecoveryEvent::StageStarted {
            stage,
            at: Local::now(),
        });

        let report = self.exit_chain().run(cancel, self.observer.as_ref());

        if report.succeeded() {
            self.observer.on_event(&RecoveryEvent::StageFinished {
                stage,
                at: Local::now(),
                note: report.winner().map(|w| format!("exited via {w}")),
            });
            self.observer.on_event(&RecoveryEvent::Completed);
        } else if report.cancelled {
            self.observer.on_event(&RecoveryEvent::Cancelled { stage });
        } else {
            self.observer.on_event(&RecoveryEvent::Failed {
                stage,
                reasons: report.failure_reasons(),
            });
        }
        Ok(report)
    }

    /// Put a booted device into recovery mode and wait for it on the bus.
    #[instrument(skip_all)]
    pub fn enter_recovery(&self, cancel: &CancelToken) -> Result<DeviceDescriptor, RecoveryError> {
        let _guard = OperationGuard::acquire()?;
        let stage = RestoreStage::EnterRecovery;
        self.observer.on_event(&RecoveryEvent::StageStarted {
            stage,
            at: Local::now(),
        });

        let result = self.enter_recovery_inner(cancel);
        match &result {
            Ok(device) => {
                self.observer.on_event(&RecoveryEvent::StageFinished {
                    stage,
                    at: Local::now(),
                    note: Some(device.to_string()),
                });
                self.observer.on_event(&RecoveryEvent::Completed);
            }
            Err(RecoveryError::Cancelled) => {
                self.observer.on_event(&RecoveryEvent::Cancelled { stage });
            }
            Err(e) => {
                self.observer.on_event(&RecoveryEvent::Failed {
                    stage,
                    reasons: vec![e.to_string()],
                });
            }
        }
        result
    }

    fn enter_recovery_inner(&self, cancel: &CancelToken) -> Result<DeviceDescriptor, RecoveryError> {
        let c = &self.collaborators;
        if let Some(device) = find_session_device(c.bus.as_ref()) {
            self.observer
                .on_event(&RecoveryEvent::info("Device is already in recovery mode"));
            return Ok(device);
        }

        let udid = c
            .normal
            .list_devices(cancel)
            .into_iter()
            .next()
            .ok_or_else(|| RecoveryError::DeviceNotFound("no device found in normal mode".into()))?;

        request_recovery(
            c,
            &udid,
            self.config.timing.recovery_policy(),
            cancel,
            self.observer.as_ref(),
        )
    }
}

/// Ask `udid` to reboot into recovery mode and poll until it shows up.
fn request_recovery(
    collaborators: &Collaborators,
    udid: &str,
    policy: PollPolicy,
    cancel: &CancelToken,
    observer: &dyn RecoveryObserver,
) -> Result<DeviceDescriptor, RecoveryError> {
    observer.on_event(&RecoveryEvent::info(format!(
        "Sending device {udid} to recovery mode..."
    )));
    if !collaborators.normal.enter_recovery(udid, cancel) {
        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }
        return Err(RecoveryError::ExternalToolFailed(format!(
            "device {udid} did not accept the enter-recovery request"
        )));
    }

    observer.on_event(&RecoveryEvent::info(
        "Waiting for device to enter recovery mode...",
    ));
    let bus = collaborators.bus.as_ref();
    match policy.poll(cancel, || find_session_device(bus)) {
        Some(device) => {
            observer.on_event(&RecoveryEvent::DeviceDetected {
                description: device.to_string(),
            });
            Ok(device)
        }
        None if cancel.is_cancelled() => Err(RecoveryError::Cancelled),
        None => Err(RecoveryError::DeviceNotFound(format!(
            "timeout waiting for recovery mode after {} checks",
            policy.attempts
        ))),
    }
}

/// Handle to a running restore.
pub struct RestoreRun {
    state: Arc<Mutex<RunState>>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl RestoreRun {
    /// Snapshot of stage, progress and status.
    pub fn status(&self) -> RunState {
        lock_state(&self.state).clone()
    }

    /// Request cancellation. Takes effect between steps; a running external
    /// tool is killed.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the worker and return the final state.
    pub fn join(mut self) -> RunState {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Restore worker panicked");
                lock_state(&self.state).fail(vec!["restore worker panicked".into()]);
            }
        }
        self.status()
    }
}

fn lock_state(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Facts gathered by earlier stages for later ones.
#[derive(Default)]
struct RunContext {
    info: Option<IpswInfo>,
    identity: DeviceIdentity,
    bundle: Option<FirmwareBundle>,
    signing: Option<SigningOutcome>,
}

impl RunContext {
    fn signing(&self) -> SigningOutcome {
        self.signing
            .clone()
            .unwrap_or_else(|| SigningOutcome::Unsigned {
                reason: "signing was not negotiated".into(),
            })
    }
}

/// Stage result: `Some(note)` marks an advisory.
type StageResult = Result<Option<String>, RecoveryError>;

struct RestoreWorker<O: RecoveryObserver> {
    config: RestoreConfig,
    collaborators: Arc<Collaborators>,
    observer: Arc<O>,
    state: Arc<Mutex<RunState>>,
    cancel: CancelToken,
}

impl<O: RecoveryObserver> RestoreWorker<O> {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        lock_state(&self.state)
    }

    fn log(&self, message: impl Into<String>) {
        self.observer.on_event(&RecoveryEvent::info(message));
    }

    fn advance(&self, percent: u8) {
        let changed = self.lock().advance(percent);
        if changed {
            self.observer.on_event(&RecoveryEvent::Progress { percent });
        }
    }

    fn archive(&self) -> Result<&Path, RecoveryError> {
        self.config
            .archive
            .as_deref()
            .ok_or_else(|| RecoveryError::ValidationFailed("no firmware archive selected".into()))
    }

    #[instrument(skip_all, fields(erase = self.config.erase))]
    fn run(self) {
        info!("Starting restore");
        self.advance(START_PROGRESS);

        let mut ctx = RunContext::default();
        let result = self.run_stages(&mut ctx);

        if let Some(bundle) = ctx.bundle.take() {
            bundle.cleanup();
        }
        self.finish(result);
    }

    fn run_stages(&self, ctx: &mut RunContext) -> Result<(), RecoveryError> {
        for stage in RestoreStage::SEQUENCE {
            self.lock().enter(stage);
            if self.cancel.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }

            info!(
                stage = %stage,
                "[STEP {}/{}] {}",
                stage.step().unwrap_or_default(),
                RestoreStage::SEQUENCE.len(),
                stage
            );
            self.observer.on_event(&RecoveryEvent::StageStarted {
                stage,
                at: Local::now(),
            });

            let outcome = match self.execute(stage, ctx) {
                Ok(None) => StageOutcome::Success,
                Ok(Some(note)) => StageOutcome::AdvisorySkip(note),
                Err(e) => StageOutcome::from(Err(e)),
            };

            let note = match outcome {
                StageOutcome::Success => None,
                StageOutcome::AdvisorySkip(note) => {
                    warn!(stage = %stage, note = %note, "Continuing after advisory");
                    self.lock().notes.push(note.clone());
                    Some(note)
                }
                StageOutcome::Fatal(e) => return Err(e),
            };

            self.observer.on_event(&RecoveryEvent::StageFinished {
                stage,
                at: Local::now(),
                note,
            });
            self.advance(stage.completion_progress());
        }
        Ok(())
    }

    fn finish(&self, result: Result<(), RecoveryError>) {
        match result {
            Ok(()) => {
                self.lock().complete();
                info!("Restore completed");
                self.observer.on_event(&RecoveryEvent::Completed);
            }
            Err(RecoveryError::Cancelled) => {
                let stage = {
                    let mut state = self.lock();
                    state.cancel();
                    state.stage
                };
                self.observer.on_event(&RecoveryEvent::Cancelled { stage });
            }
            Err(e) => {
                let reasons = vec![e.to_string()];
                let stage = {
                    let mut state = self.lock();
                    state.fail(reasons.clone());
                    state.stage
                };
                error!(stage = %stage, error = %e, "Restore failed");
                self.observer
                    .on_event(&RecoveryEvent::Failed { stage, reasons });
            }
        }
    }

    fn execute(&self, stage: RestoreStage, ctx: &mut RunContext) -> StageResult {
        match stage {
            RestoreStage::ValidateBundle => self.validate_bundle(ctx),
            RestoreStage::DetectDevice => self.detect_device(ctx),
            RestoreStage::EnterRecovery => self.enter_recovery(ctx),
            RestoreStage::ExtractFirmware => self.extract_firmware(ctx),
            RestoreStage::NegotiateSigning => self.negotiate_signing(ctx),
            RestoreStage::FlashBootloaders => self.flash_bootloaders(ctx),
            RestoreStage::LoadRamdiskAndKernel => self.load_ramdisk_and_kernel(ctx),
            RestoreStage::PerformRestore => self.perform_restore(ctx),
            RestoreStage::ExitRecovery | RestoreStage::Completed | RestoreStage::Failed => {
                Ok(None)
            }
        }
    }

    fn validate_bundle(&self, ctx: &mut RunContext) -> StageResult {
        let archive = self.archive()?;
        let info = IpswArchive::open(archive)?.validate()?;
        self.log(format!("IPSW validated: iOS {} ({})", info.version, info.build));
        ctx.info = Some(info);
        Ok(None)
    }

    fn detect_device(&self, ctx: &mut RunContext) -> StageResult {
        enum Found {
            Normal(String),
            Recovery(DeviceDescriptor),
        }

        let c = &self.collaborators;
        let bus = c.bus.as_ref();
        let found = self.config.timing.detect_policy().poll(&self.cancel, || {
            if let Some(udid) = c.normal.list_devices(&self.cancel).into_iter().next() {
                return Some(Found::Normal(udid));
            }
            find_recovery_devices(bus).into_iter().next().map(Found::Recovery)
        });

        match found {
            Some(Found::Normal(udid)) => {
                ctx.identity =
                    DeviceIdentity::from_normal_mode(c.normal.as_ref(), &udid, &self.cancel);
                self.observer.on_event(&RecoveryEvent::DeviceDetected {
                    description: format!(
                        "{} ({udid}) in Normal Mode",
                        ctx.identity.product_type.as_deref().unwrap_or(IpswInfo::UNKNOWN)
                    ),
                });
            }
            Some(Found::Recovery(device)) => {
                self.observer.on_event(&RecoveryEvent::DeviceDetected {
                    description: device.to_string(),
                });
                ctx.identity.merge(self.recovery_identity());
            }
            None if self.cancel.is_cancelled() => return Err(RecoveryError::Cancelled),
            None => {
                return Err(RecoveryError::DeviceNotFound(
                    "no device detected; connect the device and try again".into(),
                ));
            }
        }

        match &ctx.identity.product_type {
            Some(product) => {
                self.log(format!("Device detected: {product}"));
                Ok(None)
            }
            None => Ok(Some(
                "device product type unknown; firmware components matched by name only".into(),
            )),
        }
    }

    /// Identifiers reported by the recovery tool, if one is installed.
    fn recovery_identity(&self) -> DeviceIdentity {
        let Some(tool) = self.collaborators.available_tool() else {
            return DeviceIdentity::default();
        };
        match tool.query_info(&self.cancel) {
            Ok(values) => RecoveryIdentity::from_query(&values).into(),
            Err(e) => {
                debug!(error = %e, "Recovery identity query failed");
                DeviceIdentity::default()
            }
        }
    }

    fn enter_recovery(&self, ctx: &mut RunContext) -> StageResult {
        let c = &self.collaborators;
        if find_session_device(c.bus.as_ref()).is_some() {
            self.log("Device is already in recovery mode");
            return Ok(None);
        }

        let udid = ctx
            .identity
            .udid
            .clone()
            .or_else(|| c.normal.list_devices(&self.cancel).into_iter().next())
            .ok_or_else(|| RecoveryError::DeviceNotFound("no device found in normal mode".into()))?;

        request_recovery(
            c,
            &udid,
            self.config.timing.recovery_policy(),
            &self.cancel,
            self.observer.as_ref(),
        )?;
        ctx.identity.merge(self.recovery_identity());
        self.log("Device is in recovery mode");
        Ok(None)
    }

    fn extract_firmware(&self, ctx: &mut RunContext) -> StageResult {
        let archive = self.archive()?;
        let product = ctx
            .identity
            .product_type
            .clone()
            .unwrap_or_else(|| IpswInfo::UNKNOWN.to_string());

        let reader = match &self.config.scratch_root {
            Some(root) => BundleReader::with_scratch_root(root),
            None => BundleReader::new(),
        };
        let bundle = ctx.bundle.insert(reader.extract(archive, &product)?);

        bundle.require_path(Component::Ibss)?;
        bundle.require_path(Component::Ibec)?;

        let missing: Vec<&str> = Component::PATTERN_MATCHED
            .into_iter()
            .filter(|c| !c.is_required() && !bundle.contains(*c))
            .map(Component::name)
            .collect();
        if missing.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "optional components not present: {}",
                missing.join(", ")
            )))
        }
    }

    fn negotiate_signing(&self, ctx: &mut RunContext) -> StageResult {
        let bundle = ctx.bundle.as_ref().ok_or_else(not_extracted)?;
        let identity = &ctx.identity;

        let mut request = SigningRequest::new(identity.ecid.clone().unwrap_or_default());
        request.chip_id = identity.chip_id.clone().unwrap_or_default();
        request.board_id = identity.board_id.clone().unwrap_or_default();
        request.product_type = identity.product_type.clone().unwrap_or_default();
        request.build = ctx
            .info
            .as_ref()
            .map(|info| info.build.clone())
            .unwrap_or_default();
        request.add_bundle(bundle);

        let negotiator = SigningNegotiator::with_url(
            Box::new(Arc::clone(&self.collaborators.signing)),
            self.config.signing_url.as_str(),
        );
        let outcome = ctx.signing.insert(negotiator.negotiate(&request));
        match outcome {
            SigningOutcome::Signed(blobs) => {
                self.log(format!("Received {} signed blobs", blobs.len()));
                Ok(None)
            }
            SigningOutcome::Unsigned { reason } => {
                Err(RecoveryError::SigningUnavailable(reason.clone()))
            }
        }
    }

    fn backend(&self) -> DeviceFlashBackend<'_> {
        DeviceFlashBackend::new(
            self.collaborators.bus.as_ref(),
            self.collaborators.available_tool(),
            self.config.timing.client_settings(),
            self.cancel.clone(),
        )
    }

    fn flash_bootloaders(&self, ctx: &mut RunContext) -> StageResult {
        let bundle = ctx.bundle.as_ref().ok_or_else(not_extracted)?;
        let ibss = bundle.require_path(Component::Ibss)?;
        let ibec = bundle.require_path(Component::Ibec)?;
        let signing = ctx.signing();
        for component in [Component::Ibss, Component::Ibec] {
            let mode = SigningMode::for_component(&signing, component);
            self.log(format!("Sending {component} ({mode})"));
        }

        self.config
            .timing
            .flash_sequencer()
            .flash(&mut self.backend(), ibss, ibec, &signing)?;
        self.log("Bootloaders loaded");
        Ok(None)
    }

    fn load_ramdisk_and_kernel(&self, ctx: &mut RunContext) -> StageResult {
        let bundle = ctx.bundle.as_ref().ok_or_else(not_extracted)?;
        let report = load_ramdisk_and_kernel(
            &mut self.backend(),
            bundle,
            &ctx.signing(),
            self.config.timing.settle(),
        )?;

        for component in &report.loaded {
            self.log(format!("{component} loaded"));
        }
        if report.notes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(report.notes.join("; ")))
        }
    }

    fn perform_restore(&self, ctx: &mut RunContext) -> StageResult {
        let archive = self.archive()?;
        let info = ctx.info.clone().unwrap_or_else(|| IpswInfo {
            version: IpswInfo::UNKNOWN.into(),
            build: IpswInfo::UNKNOWN.into(),
        });
        let from = self.lock().progress;
        let handoff_ctx = HandoffContext {
            archive,
            info: &info,
            erase: self.config.erase,
            from,
        };

        let mut progress = |percent: u8| self.advance(percent);
        self.collaborators.handoff.perform(
            &handoff_ctx,
            self.observer.as_ref(),
            &mut progress,
            &self.cancel,
        )?;
        Ok(None)
    }
}

fn not_extracted() -> RecoveryError {
    RecoveryError::ValidationFailed("firmware components were not extracted".into())
}
