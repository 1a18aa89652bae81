// USB identifiers
pub const APPLE_VENDOR_ID: u16 = 0x05AC;
pub const RECOVERY_MODE_PID: u16 = 0x1281;
pub const DFU_MODE_PID: u16 = 0x1227;
pub const WTF_MODE_PID: u16 = 0x1222;

/// Product ids the in-process client is willing to open.
pub const SESSION_PIDS: [u16; 2] = [RECOVERY_MODE_PID, DFU_MODE_PID];

// USB configuration
pub const USB_CONFIGURATION: u8 = 1;
pub const USB_INTERFACE: u8 = 0;
pub const USB_TIMEOUT_MS: u64 = 5000;

// iRecovery endpoints
pub const ENDPOINT_OUT: u8 = 0x04; // bulk out, command channel
pub const ENDPOINT_IN: u8 = 0x85; // bulk in, status channel (0x05 | 0x80)

// Control transfer parameters
pub const REQ_TYPE_VENDOR_OUT: u8 = 0x40; // vendor, device, host-to-device
pub const REQ_REBOOT: u8 = 0x00;

/// Payloads at or below this size go out as a single bulk write.
pub const SINGLE_WRITE_THRESHOLD: usize = 0x200;

/// Fallback when the endpoint descriptor does not report a packet size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 0x200;

// Settle delays
pub const COMMAND_SETTLE_MS: u64 = 100;
pub const REBOOT_SETTLE_MS: u64 = 500;
pub const ENV_SETTLE_MS: u64 = 200;

// iBoot commands
pub const CMD_REBOOT: &str = "reboot";
pub const CMD_SETENV_AUTOBOOT: &str = "setenv auto-boot true";
pub const CMD_SAVEENV: &str = "saveenv";
pub const CMD_DEVICETREE: &str = "devicetree";
pub const CMD_RAMDISK: &str = "ramdisk";
pub const CMD_BOOTX: &str = "bootx";
