//! Upload a multiboot program to a linked GBA emulator and launch it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use crossbeam_channel as cb;
use log::{error, info};

use joybus_link::endpoint::{Endpoint, StatusCell};
use joybus_link::listener::Listener;
use joybus_link::protocol::{CLOCK_PORT, DATA_PORT, JSTAT_PSF1, JSTAT_SEND, JoyReturn};
use joybus_link::ticks;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    fn as_filter_str(self) -> &'static str {
        match self {
            LogLevelArg::Off => "off",
            LogLevelArg::Error => "error",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Info => "info",
            LogLevelArg::Debug => "debug",
            LogLevelArg::Trace => "trace",
        }
    }
}

#[derive(Parser)]
#[command(
    name = "joyboot",
    about = "Upload a multiboot program to a GBA emulator over the JoyBus link"
)]
struct Args {
    /// Multiboot client image (at least 512 bytes).
    rom: PathBuf,

    /// Palette of the pulsing logo shown on the GBA during transfer [0,6].
    #[arg(long, default_value_t = 2)]
    palette_color: i32,

    /// Speed and direction of the logo palette interpolation [-4,4].
    #[arg(long, default_value_t = 2, allow_hyphen_values = true)]
    palette_speed: i32,

    /// TCP port to listen on for the emulator's data channel.
    #[arg(long, default_value_t = DATA_PORT)]
    data_port: u16,

    /// TCP port to listen on for the emulator's clock channel.
    #[arg(long, default_value_t = CLOCK_PORT)]
    clock_port: u16,

    /// Log level filter (defaults to info; RUST_LOG overrides).
    #[arg(long)]
    log_level: Option<LogLevelArg>,
}

fn init_logging(args: &Args) {
    let default_filter = args.log_level.map_or("info", LogLevelArg::as_filter_str);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();
}

/// Fix up the header checksum complement at 0xbd, covering 0xa0..0xbd.
fn fix_header_complement(image: &mut [u8]) {
    let mut check = 0x19u8;
    for &byte in &image[0xa0..0xbd] {
        check = check.wrapping_add(byte);
    }
    image[0xbd] = check.wrapping_neg();
}

/// After the boot acknowledgement, the client program needs a moment before
/// it services the bus again.
fn boot_settled(endpoint: &Endpoint, status: &StatusCell) -> bool {
    if endpoint.reset(status) == JoyReturn::NotReady
        && endpoint.reset(status) == JoyReturn::NotReady
    {
        return false;
    }
    if endpoint.get_status(status) == JoyReturn::NotReady {
        return false;
    }
    status.get() == (JSTAT_PSF1 | JSTAT_SEND)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let mut image = match std::fs::read(&args.rom) {
        Ok(image) => image,
        Err(err) => {
            error!("unable to read {}: {err}", args.rom.display());
            return ExitCode::FAILURE;
        }
    };
    if image.len() < 512 {
        error!("{} must be at least 512 bytes", args.rom.display());
        return ExitCode::FAILURE;
    }
    fix_header_complement(&mut image);

    let mut listener = Listener::new();
    if let Err(err) = listener.start_on(args.data_port, args.clock_port) {
        error!("{err}");
        return ExitCode::FAILURE;
    }
    info!(
        "listening for an emulator pair on ports {}/{}",
        args.data_port, args.clock_port
    );

    let endpoint = loop {
        if let Some(endpoint) = listener.accept() {
            break endpoint;
        }
        ticks::sleep(ticks::TICKS_PER_SEC / 60);
    };
    info!("emulator connected on channel {}", endpoint.chan());

    // Give the BIOS a few seconds on the bus before the challenge.
    ticks::sleep(ticks::TICKS_PER_SEC * 4);

    let status = StatusCell::new();
    let (done_tx, done_rx) = cb::bounded(1);
    let submitted = endpoint.joy_boot_async(
        args.palette_color,
        args.palette_speed,
        &image,
        &status,
        Box::new(move |_endpoint, boot_status| {
            let _ = done_tx.try_send(boot_status);
        }),
    );
    if submitted != JoyReturn::Ready {
        error!("unable to start JoyBoot: {submitted:?}");
        return ExitCode::FAILURE;
    }

    let start = ticks::now();
    let mut last_percent = 0u8;
    loop {
        let (state, percent) = endpoint.process_status();
        if state != JoyReturn::Busy {
            break;
        }
        if percent != last_percent {
            last_percent = percent;
            info!("upload {percent}%");
        }
        if ticks::now() - start > ticks::TICKS_PER_SEC * 10 {
            error!("JoyBoot timeout");
            return ExitCode::FAILURE;
        }
        ticks::sleep(ticks::TICKS_PER_SEC / 60);
    }

    match done_rx.try_recv() {
        Ok(JoyReturn::Ready) => info!("JoyBoot finished, JSTAT {:#04x}", status.get()),
        Ok(other) => {
            error!("JoyBoot failed: {other:?}");
            return ExitCode::FAILURE;
        }
        Err(_) => {
            error!("JoyBoot did not complete");
            return ExitCode::FAILURE;
        }
    }

    while !boot_settled(&endpoint, &status) {
        if ticks::now() - start > ticks::TICKS_PER_SEC * 15 {
            error!("client program did not come up");
            return ExitCode::FAILURE;
        }
        ticks::sleep(ticks::TICKS_PER_SEC / 60);
    }
    info!("client program running");
    ExitCode::SUCCESS
}
