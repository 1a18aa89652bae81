//! The final restore stage.
//!
//! Streaming the root filesystem through the restore ramdisk is a separate
//! protocol. This stage is a seam for it; the default implementation
//! hands off to an external restore tool with instructions.

use std::path::Path;
use std::time::Duration;

use crate::bundle::IpswInfo;
use crate::cancel::CancelToken;
use crate::error::RecoveryError;
use crate::events::{RecoveryEvent, RecoveryObserver};

/// Inputs of the final stage.
#[derive(Debug, Clone, Copy)]
pub struct HandoffContext<'a> {
    pub archive: &'a Path,
    pub info: &'a IpswInfo,
    pub erase: bool,
    /// Progress when the stage starts.
    pub from: u8,
}

/// Performs (or hands off) the filesystem restore.
pub trait RestoreHandoff: Send + Sync {
    /// `progress` must only be called with non-decreasing values up to 100.
    fn perform(
        &self,
        ctx: &HandoffContext<'_>,
        observer: &dyn RecoveryObserver,
        progress: &mut dyn FnMut(u8),
        cancel: &CancelToken,
    ) -> Result<(), RecoveryError>;
}

/// Prints how to finish the restore and advances progress in fixed steps.
#[derive(Debug, Clone, Copy)]
pub struct ManualHandoff {
    pub steps: u8,
    pub tick: Duration,
}

impl Default for ManualHandoff {
    fn default() -> Self {
        Self {
            steps: 10,
            tick: Duration::from_secs(1),
        }
    }
}

impl ManualHandoff {
    pub fn instructions(ctx: &HandoffContext<'_>) -> Vec<String> {
        let flag = if ctx.erase { "-e" } else { "-u" };
        vec![
            format!(
                "Device is prepared for restoring iOS {} ({}).",
                ctx.info.version, ctx.info.build
            ),
            "Bootloaders are loaded; the filesystem restore must be completed by a full restore tool.".into(),
            "Option 1: keep the device connected and restore from Finder/iTunes, selecting the IPSW.".into(),
            format!(
                "Option 2: idevicerestore {flag} \"{}\"  (-e erases all data, -u updates)",
                ctx.archive.display()
            ),
            "Option 3: run exit-recovery to boot back into the installed OS.".into(),
        ]
    }
}

impl RestoreHandoff for ManualHandoff {
    fn perform(
        &self,
        ctx: &HandoffContext<'_>,
        observer: &dyn RecoveryObserver,
        progress: &mut dyn FnMut(u8),
        cancel: &CancelToken,
    ) -> Result<(), RecoveryError> {
        for line in Self::instructions(ctx) {
            observer.on_event(&RecoveryEvent::info(line));
        }

        let steps = self.steps.max(1);
        let span = 100u8.saturating_sub(ctx.from);
        for i in 1..=steps {
            if !cancel.sleep(self.tick) {
                return Err(RecoveryError::Cancelled);
            }
            let value = ctx.from + ((u16::from(span) * u16::from(i)) / u16::from(steps)) as u8;
            progress(value);
            observer.on_event(&RecoveryEvent::log(
                crate::events::LogLevel::Debug,
                format!("Device ready... {i}/{steps}"),
            ));
        }
        Ok(())
    }
}
