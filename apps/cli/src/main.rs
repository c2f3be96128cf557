use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dfu_core::transport::NusbTransport;
use dfu_core::{
    Cancellable, Device, DfuConfig, Firmware, FirmwareFormat, ParseFlags, QUIRK_TABLE,
    TracingObserver, TransferFlags, UsbTransport,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB DFU / DfuSe firmware tool (Pure Rust)", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached DFU-capable devices
    List,
    /// Read firmware from a device into a file
    Upload {
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// Output format (dfu, dfuse, raw, ihex); defaults to what the device suggests
        #[arg(long)]
        format: Option<FirmwareFormat>,
    },
    /// Write a firmware file to a device
    Download {
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// Read back and compare after writing
        #[arg(long)]
        verify: bool,
        /// Accept firmware whose VID/PID or alt-setting does not match the device
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        parse: ParseArgs,
    },
    /// Print the contents of a firmware file
    Dump {
        file: PathBuf,
        #[command(flatten)]
        parse: ParseArgs,
    },
    /// Convert a firmware file to another container format
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Target format (raw, dfu, dfuse, ihex)
        #[arg(long)]
        format: FirmwareFormat,
        #[command(flatten)]
        parse: ParseArgs,
    },
    /// Set the vendor ID stored in a firmware file
    SetVid {
        file: PathBuf,
        #[arg(value_parser = parse_hex_u16)]
        vid: u16,
    },
    /// Set the product ID stored in a firmware file
    SetPid {
        file: PathBuf,
        #[arg(value_parser = parse_hex_u16)]
        pid: u16,
    },
    /// Set the release number stored in a firmware file
    SetRelease {
        file: PathBuf,
        #[arg(value_parser = parse_hex_u16)]
        release: u16,
    },
    /// Print the built-in quirk table
    Quirks,
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Device to use, as VID:PID in hex
    #[arg(short, long, value_parser = parse_vid_pid)]
    device: Option<(u16, u16)>,

    /// Detach a runtime-mode device first
    #[arg(long)]
    detach: bool,

    /// Return the device to runtime mode afterwards and wait for it
    #[arg(long)]
    attach: bool,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Do not check the DFU suffix CRC
    #[arg(long)]
    no_crc_test: bool,

    /// Accept unknown DFU versions in the suffix
    #[arg(long)]
    no_version_test: bool,
}

impl ParseArgs {
    fn flags(&self) -> ParseFlags {
        let mut flags = ParseFlags::empty();
        flags.set(ParseFlags::NO_CRC_TEST, self.no_crc_test);
        flags.set(ParseFlags::NO_VERSION_TEST, self.no_version_test);
        flags
    }
}

impl DeviceArgs {
    fn flags(&self) -> TransferFlags {
        let mut flags = TransferFlags::empty();
        flags.set(TransferFlags::DETACH, self.detach);
        flags.set(
            TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME,
            self.attach,
        );
        flags
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_vid_pid(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;
    Ok((parse_hex_u16(vid)?, parse_hex_u16(pid)?))
}

fn load_config(path: Option<&PathBuf>) -> Result<DfuConfig> {
    match path {
        Some(path) => DfuConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(DfuConfig::default()),
    }
}

fn open_device(args: &DeviceArgs, config: DfuConfig) -> Result<Device<NusbTransport>> {
    let transport = match args.device {
        Some((vid, pid)) => NusbTransport::open_with_ids(vid, pid)?,
        None => NusbTransport::open()?,
    };
    let mut device = Device::new(transport, config)?.with_observer(Arc::new(TracingObserver));
    device.open()?;
    Ok(device)
}

fn list(config: &DfuConfig) -> Result<()> {
    let devices = NusbTransport::list()?;
    if devices.is_empty() {
        println!("No DFU-capable devices found");
        return Ok(());
    }
    for info in devices {
        let transport = NusbTransport::open_device_info(info)?;
        let identity = transport.identity();
        let device = match Device::new(transport, config.clone()) {
            Ok(device) => device,
            Err(e) => {
                println!("{}: {}", identity, e);
                continue;
            }
        };
        println!("{}", identity);
        println!("  Mode:         {:?}", device.mode());
        println!("  DFU version:  0x{:04x}", device.version());
        println!("  Transfer size: {}", device.transfer_size());
        println!("  Attributes:   {:?}", device.attributes());
        let quirks = device.quirks_string();
        if !quirks.is_empty() {
            println!("  Quirks:       {}", quirks);
        }
        for target in device.targets() {
            println!(
                "  Alt {}: {}",
                target.alt_setting(),
                target.alt_name().unwrap_or("(unnamed)")
            );
            for sector in target.sectors() {
                println!("    {}", sector);
            }
        }
    }
    Ok(())
}

fn upload(
    file: &PathBuf,
    args: &DeviceArgs,
    format: Option<FirmwareFormat>,
    config: DfuConfig,
) -> Result<()> {
    let mut device = open_device(args, config)?;
    let mut firmware = device.upload(args.flags(), &Cancellable::new())?;
    if let Some(format) = format {
        firmware.set_format(format);
    }
    firmware
        .write_file(file)
        .with_context(|| format!("writing {}", file.display()))?;
    info!(size = firmware.size(), file = %file.display(), "Upload complete");
    Ok(())
}

fn download(
    file: &PathBuf,
    args: &DeviceArgs,
    verify: bool,
    force: bool,
    parse: ParseFlags,
    config: DfuConfig,
) -> Result<()> {
    let firmware = Firmware::parse_file(file, parse)
        .with_context(|| format!("reading {}", file.display()))?;
    let mut flags = args.flags();
    flags.set(TransferFlags::VERIFY, verify);
    flags.set(
        TransferFlags::WILDCARD_VID | TransferFlags::WILDCARD_PID | TransferFlags::WILDCARD_ALT,
        force,
    );
    let mut device = open_device(args, config)?;
    device.download(&firmware, flags, &Cancellable::new())?;
    info!(size = firmware.size(), "Download complete");
    Ok(())
}

fn edit(file: &PathBuf, apply: impl FnOnce(&mut Firmware)) -> Result<()> {
    let mut firmware = Firmware::parse_file(file, ParseFlags::empty())
        .with_context(|| format!("reading {}", file.display()))?;
    if matches!(firmware.format(), FirmwareFormat::Raw | FirmwareFormat::IntelHex) {
        bail!("{} has no DFU suffix to hold device IDs", file.display());
    }
    apply(&mut firmware);
    firmware.write_file(file)?;
    print!("{}", firmware);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::List => list(&config),
        Command::Upload {
            file,
            device,
            format,
        } => upload(&file, &device, format, config),
        Command::Download {
            file,
            device,
            verify,
            force,
            parse,
        } => download(&file, &device, verify, force, parse.flags(), config),
        Command::Dump { file, parse } => {
            let firmware = Firmware::parse_file(&file, parse.flags())
                .with_context(|| format!("reading {}", file.display()))?;
            print!("{}", firmware);
            Ok(())
        }
        Command::Convert {
            input,
            output,
            format,
            parse,
        } => {
            let mut firmware = Firmware::parse_file(&input, parse.flags())
                .with_context(|| format!("reading {}", input.display()))?;
            firmware.set_format(format);
            firmware
                .write_file(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(from = %input.display(), to = %output.display(), format = %format, "Converted");
            Ok(())
        }
        Command::SetVid { file, vid } => edit(&file, |fw| fw.set_vid(vid)),
        Command::SetPid { file, pid } => edit(&file, |fw| fw.set_pid(pid)),
        Command::SetRelease { file, release } => edit(&file, |fw| fw.set_release(release)),
        Command::Quirks => {
            for entry in QUIRK_TABLE {
                let release = entry
                    .release
                    .map(|r| format!("{:04x}", r))
                    .unwrap_or_else(|| "*".into());
                println!(
                    "{:04x}:{:04x}-{:04x} rel {}  {}",
                    entry.vid,
                    entry.pids.start(),
                    entry.pids.end(),
                    release,
                    entry.quirks
                );
            }
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_hex_u16("0x0483"), Ok(0x0483));
        assert_eq!(parse_hex_u16("DF11"), Ok(0xDF11));
        assert!(parse_hex_u16("xyz").is_err());
        assert_eq!(parse_vid_pid("0483:df11"), Ok((0x0483, 0xDF11)));
        assert!(parse_vid_pid("0483").is_err());
    }

    #[test]
    fn test_cli_download_flags() {
        let cli = Cli::parse_from([
            "dfu-tool", "download", "fw.dfu", "--device", "0483:df11", "--detach", "--attach",
            "--verify", "--no-crc-test",
        ]);
        match cli.command {
            Command::Download {
                device,
                verify,
                parse,
                ..
            } => {
                assert!(verify);
                assert_eq!(device.device, Some((0x0483, 0xDF11)));
                assert_eq!(
                    device.flags(),
                    TransferFlags::DETACH | TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME
                );
                assert_eq!(parse.flags(), ParseFlags::NO_CRC_TEST);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_convert_format() {
        let cli = Cli::parse_from(["dfu-tool", "convert", "a.hex", "b.dfu", "--format", "dfuse"]);
        assert!(matches!(
            cli.command,
            Command::Convert {
                format: FirmwareFormat::DfuSe,
                ..
            }
        ));
    }
}
