//! hidpp-harness CLI: receiver and device bring-up from the command line.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hidpp_harness_core::channel::{ChannelId, ChannelIdentifier};
use hidpp_harness_core::config::HarnessConfig;
use hidpp_harness_core::facade::Harness;
use hidpp_harness_core::hidpp::features;
use hidpp_harness_core::messages::hidpp10::AuthMethod;
use hidpp_harness_core::pairing::UserActionEmulator;
use hidpp_harness_core::protocol::LinkStatus;
use hidpp_harness_core::queue::QueueName;
use hidpp_harness_core::receiver::{self, format_address, parse_address};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Features probed by `features`.
const KNOWN_FEATURES: [(u16, &str); 7] = [
    (features::ROOT, "ROOT"),
    (features::FEATURE_SET, "FEATURE_SET"),
    (features::DEVICE_NAME, "DEVICE_NAME"),
    (features::BATTERY_STATUS, "BATTERY_STATUS"),
    (features::UNIFIED_BATTERY, "UNIFIED_BATTERY"),
    (features::WIRELESS_DEVICE_STATUS, "WIRELESS_DEVICE_STATUS"),
    (features::PER_KEY_LIGHTING_V2, "PER_KEY_LIGHTING_V2"),
];

#[derive(Parser)]
#[command(
    name = "hidpp-harness",
    version,
    about = "HID++ receiver and device bring-up"
)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected Logitech devices and receivers.
    List,
    /// Print the effective configuration as JSON.
    Config,
    /// Look up the index of well-known HID++ 2.0 features.
    Features {
        /// Product ID (hex) of the device or receiver.
        #[arg(value_parser = parse_pid)]
        pid: u16,
        /// Pairing slot when the device sits behind a receiver.
        #[arg(long)]
        slot: Option<u8>,
    },
    /// Print messages arriving on one queue.
    Listen {
        #[arg(value_parser = parse_pid)]
        pid: u16,
        /// Queue name, e.g. RECEIVER_EVENT.
        #[arg(value_parser = parse_queue)]
        queue: QueueName,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Pair a BLE Pro device through a receiver.
    Pair {
        /// Receiver product ID (hex).
        #[arg(value_parser = parse_pid)]
        pid: u16,
        /// Device address (AA:BB:CC:DD:EE:FF); discovered when omitted.
        #[arg(long, value_parser = parse_bluetooth_address)]
        address: Option<[u8; 6]>,
        /// Type the passkey on a keyboard instead of the two-button method.
        #[arg(long)]
        passkey: bool,
        #[arg(long, default_value_t = 20)]
        entropy: u8,
    },
    /// Clear a receiver pairing slot.
    Unpair {
        #[arg(value_parser = parse_pid)]
        pid: u16,
        slot: u8,
    },
    /// Make the receiver re-announce its paired devices.
    FakeArrival {
        #[arg(value_parser = parse_pid)]
        pid: u16,
    },
}

fn parse_pid(text: &str) -> std::result::Result<u16, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid product id {text:?}: {e}"))
}

fn parse_queue(text: &str) -> std::result::Result<QueueName, String> {
    QueueName::parse(text).ok_or_else(|| {
        let names: Vec<&str> = QueueName::ALL.iter().map(|q| q.as_str()).collect();
        format!("unknown queue {text:?}, expected one of {}", names.join(", "))
    })
}

fn parse_bluetooth_address(text: &str) -> std::result::Result<[u8; 6], String> {
    parse_address(text).ok_or_else(|| format!("invalid address {text:?}"))
}

/// Asks the operator to perform each stimulus on the device.
struct OperatorPrompt;

impl OperatorPrompt {
    fn ask(&self, instruction: &str) -> hidpp_harness_core::error::Result<()> {
        print!("{instruction}, then press Enter ");
        // a broken terminal only loses the prompt
        let _ = io::stdout().flush();
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| hidpp_harness_core::error::Error::Unsupported(format!("operator input: {e}")))?;
        Ok(())
    }
}

impl UserActionEmulator for OperatorPrompt {
    fn left_button(&self) -> hidpp_harness_core::error::Result<()> {
        self.ask("Press LEFT")
    }

    fn right_button(&self) -> hidpp_harness_core::error::Result<()> {
        self.ask("Press RIGHT")
    }

    fn both_buttons(&self) -> hidpp_harness_core::error::Result<()> {
        self.ask("Press LEFT and RIGHT together")
    }

    fn key(&self, digit: u8) -> hidpp_harness_core::error::Result<()> {
        self.ask(&format!("Type {digit}"))
    }

    fn backspace(&self) -> hidpp_harness_core::error::Result<()> {
        self.ask("Press Backspace")
    }

    fn enter(&self) -> hidpp_harness_core::error::Result<()> {
        self.ask("Press Enter on the device")
    }
}

fn open(harness: &Harness, pid: u16) -> Result<ChannelId> {
    harness
        .open_channel(&ChannelIdentifier::new().product_id(pid))
        .with_context(|| format!("no channel for PID 0x{pid:04X}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };

    match cli.command {
        Commands::List => {
            let bundles = hidpp_harness_core::device::discover_devices()?;
            if bundles.is_empty() {
                println!("No Logitech devices found.");
                println!("Ensure the receiver is plugged in and udev rules grant access.");
            }
            for bundle in &bundles {
                println!(
                    "{} (VID: 0x{:04X}, PID: 0x{:04X}, {}, id: {})",
                    bundle.label(),
                    bundle.vendor_id,
                    bundle.product_id,
                    if bundle.is_receiver() { "receiver" } else { "device" },
                    bundle.transport_id
                );
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Features { pid, slot } => {
            let harness = Harness::with_hidapi(config);
            let mut id = open(&harness, pid)?;
            if let Some(slot) = slot {
                id = harness.manager().add_through_receiver(id, slot)?;
                harness.manager().set_channel(id)?;
            }
            let channel = harness
                .manager()
                .channel(id)
                .ok_or_else(|| anyhow!("channel {id} vanished"))?;
            let (major, minor) = channel.protocol_version()?;
            println!("{} speaks HID++ {major}.{minor}", channel.identifier());
            for (feature_id, name) in KNOWN_FEATURES {
                let entry = channel.feature_entry(feature_id)?;
                if entry.is_supported() {
                    println!(
                        "  0x{feature_id:04X} {name:<24} index {:>3} version {}",
                        entry.feature_index, entry.version
                    );
                } else {
                    println!("  0x{feature_id:04X} {name:<24} not supported");
                }
            }
            harness.close();
        }
        Commands::Listen { pid, queue, seconds } => {
            let harness = Harness::with_hidapi(config);
            let id = open(&harness, pid)?;
            println!("Listening on {} for {seconds}s", queue.as_str());
            let deadline = Instant::now() + Duration::from_secs(seconds);
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                if let Some(message) = harness.get_only(id, queue, &[], remaining, false, true)? {
                    println!("{message}");
                }
            }
            harness.close();
        }
        Commands::Pair {
            pid,
            address,
            passkey,
            entropy,
        } => {
            let harness = Harness::with_hidapi(config);
            let id = open(&harness, pid)?;
            let method = if passkey {
                AuthMethod::Passkey
            } else {
                AuthMethod::TwoButton
            };
            let paired = harness.pair_device(id, address, method, entropy, &OperatorPrompt)?;
            println!(
                "Paired {} in slot {} after {} attempt(s)",
                format_address(&paired.bluetooth_address),
                paired.slot,
                paired.attempts
            );
            harness.close();
        }
        Commands::Unpair { pid, slot } => {
            let harness = Harness::with_hidapi(config);
            let id = open(&harness, pid)?;
            harness.unpair_slot(id, slot)?;
            println!("Slot {slot} cleared");
            harness.close();
        }
        Commands::FakeArrival { pid } => {
            let harness = Harness::with_hidapi(config);
            let id = open(&harness, pid)?;
            let channel = harness
                .manager()
                .channel(id)
                .ok_or_else(|| anyhow!("channel {id} vanished"))?;
            if !channel.is_receiver() {
                bail!("PID 0x{pid:04X} is not a receiver");
            }
            let slots = receiver::rebuild_connection_table(&channel)?;
            if slots.is_empty() {
                println!("No paired devices announced.");
            }
            for slot in slots {
                println!(
                    "slot {}: PID 0x{:04X} {:?} {}",
                    slot.device_index,
                    slot.bluetooth_pid,
                    slot.device_type,
                    if slot.link_status == LinkStatus::Established {
                        "connected"
                    } else {
                        "not connected"
                    }
                );
            }
            harness.close();
        }
    }

    Ok(())
}
