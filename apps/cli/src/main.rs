use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rescue_core::tools::{RecoveryTool, inventory};
use rescue_core::{
    CancelToken, Collaborators, DeviceIdentity, NusbBus, RecoverySession, RestoreConfig,
    RunStatus, find_recovery_devices, list_devices,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Apple Recovery/DFU rescue tool", long_about = None)]
struct Args {
    /// Load settings from a TOML file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding irecovery and the libimobiledevice tools
    #[arg(long, global = true)]
    tool_dir: Option<PathBuf>,

    /// Path to the irecovery binary
    #[arg(long, global = true)]
    irecovery: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices in Recovery, DFU or WTF mode
    List {
        /// Show every USB device, not only bootloader-mode ones
        #[arg(long)]
        all: bool,
    },
    /// Show identifiers of attached devices
    Info,
    /// Reboot a booted device into recovery mode
    EnterRecovery,
    /// Boot a recovery-mode device back into its OS
    ExitRecovery,
    /// Restore firmware from an IPSW archive
    Restore {
        /// IPSW archive
        ipsw: PathBuf,
        /// Erase all data instead of updating
        #[arg(long)]
        erase: bool,
        /// Parent directory for extracted components
        #[arg(long)]
        scratch: Option<PathBuf>,
        /// Signing service URL
        #[arg(long)]
        signing_url: Option<String>,
    },
    /// Report which external tools are installed
    Tools,
    /// Write the effective configuration to a TOML file
    Config {
        /// Output path
        output: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// File settings first, then command-line overrides.
fn load_config(args: &Args) -> Result<RestoreConfig> {
    let mut config = match &args.config {
        Some(path) => RestoreConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => RestoreConfig::default(),
    };
    if args.tool_dir.is_some() {
        config.tool_dir = args.tool_dir.clone();
    }
    if args.irecovery.is_some() {
        config.irecovery_path = args.irecovery.clone();
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;

    match args.command {
        Command::List { all } => {
            let bus = NusbBus::new();
            let devices = if all {
                list_devices(&bus)?
            } else {
                find_recovery_devices(&bus)
            };
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!("{device}");
            }
        }
        Command::Info => {
            let collaborators = Collaborators::system(&config)?;
            print_info(&collaborators);
        }
        Command::EnterRecovery => {
            let session = RecoverySession::new(config.clone(), Collaborators::system(&config)?);
            let cancel = CancelToken::new();
            cancel_on_interrupt(cancel.clone())?;
            let device = session.enter_recovery(&cancel)?;
            println!("Device is in recovery mode: {device}");
        }
        Command::ExitRecovery => {
            let session = RecoverySession::new(config.clone(), Collaborators::system(&config)?);
            let cancel = CancelToken::new();
            cancel_on_interrupt(cancel.clone())?;
            let report = session.exit_recovery(&cancel)?;
            match report.winner() {
                Some(strategy) => println!("Device is rebooting ({strategy})"),
                None => {
                    for reason in report.failure_reasons() {
                        println!("  - {reason}");
                    }
                    bail!("all exit methods failed; try holding Power + Home/Volume Down for 10 seconds");
                }
            }
        }
        Command::Restore {
            ipsw,
            erase,
            scratch,
            signing_url,
        } => {
            config.archive = Some(ipsw);
            config.erase = erase;
            if scratch.is_some() {
                config.scratch_root = scratch;
            }
            if let Some(url) = signing_url {
                config.signing_url = url;
            }
            restore(config)?;
        }
        Command::Tools => {
            for tool in inventory(config.tool_dir.as_deref()) {
                let mark = if tool.available { "found" } else { "missing" };
                println!("{:<22} {:<8} {}", tool.name, mark, tool.program);
            }
        }
        Command::Config { output } => {
            config.save_to_file(&output)?;
            info!(path = %output.display(), "Configuration written");
        }
    }

    Ok(())
}

/// Ctrl-C cancels `token`; the operation stops at its next check.
fn cancel_on_interrupt(token: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        warn!("Interrupted, cancelling...");
        token.cancel();
    })
    .context("installing Ctrl-C handler")
}

fn print_info(collaborators: &Collaborators) {
    let cancel = CancelToken::new();
    let udids = collaborators.normal.list_devices(&cancel);
    for udid in &udids {
        let identity =
            DeviceIdentity::from_normal_mode(collaborators.normal.as_ref(), udid, &cancel);
        println!("{udid} (Normal Mode)");
        print_identity(&identity);
    }

    let recovery = find_recovery_devices(collaborators.bus.as_ref());
    for device in &recovery {
        println!("{device}");
    }
    if let (false, Some(tool)) = (recovery.is_empty(), collaborators.tool.as_deref()) {
        match tool.query_info(&cancel) {
            Ok(values) => {
                for (key, value) in values {
                    println!("  {key}: {value}");
                }
            }
            Err(e) => warn!(error = %e, "Could not query recovery device"),
        }
    }

    if udids.is_empty() && recovery.is_empty() {
        println!("No devices found");
    }
}

fn print_identity(identity: &DeviceIdentity) {
    let fields = [
        ("ProductType", &identity.product_type),
        ("ECID", &identity.ecid),
        ("ChipID", &identity.chip_id),
        ("BoardID", &identity.board_id),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            println!("  {name}: {value}");
        }
    }
}

fn restore(config: RestoreConfig) -> Result<()> {
    let collaborators = Collaborators::system(&config)?;
    let session = RecoverySession::new(config, collaborators);

    warn!("Do NOT disconnect the device during the restore");
    let run = session.start_restore()?;
    cancel_on_interrupt(run.cancel_token())?;
    let state = run.join();

    for note in &state.notes {
        println!("note: {note}");
    }
    match state.status {
        RunStatus::Completed => {
            println!("Restore sequence completed ({}%)", state.progress);
            Ok(())
        }
        RunStatus::Failed { stage, reasons } => {
            for reason in &reasons {
                println!("  - {reason}");
            }
            bail!("restore failed at {stage} ({}%)", state.progress)
        }
        RunStatus::Cancelled { stage } => bail!("restore cancelled at {stage}"),
        RunStatus::Running => bail!("restore worker stopped unexpectedly"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_restore_args_parse() {
        let args = Args::parse_from(["irescue", "restore", "fw.ipsw", "--erase"]);
        match args.command {
            Command::Restore { ipsw, erase, .. } => {
                assert_eq!(ipsw, PathBuf::from("fw.ipsw"));
                assert!(erase);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_interrupt_cancels_operation() {
        let token = CancelToken::new();
        cancel_on_interrupt(token.clone()).unwrap();

        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() {
            assert!(Instant::now() < deadline, "interrupt did not cancel");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
