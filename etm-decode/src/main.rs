use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use etm::{ContextIdWidth, CpuState, Decoder, DecoderOptions, EtmConfig, Protocol, TraceConsumer, Verbosity};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "etm-decode", about = "Decode an ARM ETMv3.5 or MTB instruction-trace capture")]
struct Opt {
    /// Decode as MTB (fixed 8-byte source/destination pairs) instead of ETMv3.5.
    #[structopt(long)]
    mtb: bool,

    /// Width in bytes of context-ID fields in the stream: 0, 1, 2, or 4.
    #[structopt(long, default_value = "0")]
    context_id_width: u8,

    /// The stream uses the alternate branch-address encoding.
    #[structopt(long)]
    alt_addr_encode: bool,

    /// The stream carries cycle-accurate P-headers (Formats 0-4).
    #[structopt(long)]
    cycle_accurate: bool,

    /// The traced core has no instruction address tracing (DWT data-only).
    #[structopt(long)]
    data_only: bool,

    /// Trace capture to decode.
    #[structopt(parse(from_os_str))]
    file: PathBuf,
}

struct Printer;

impl TraceConsumer for Printer {
    fn on_message(&mut self, cpu: &CpuState) {
        println!("{:#?}", cpu);
    }

    fn on_report(&mut self, verbosity: Verbosity, message: std::fmt::Arguments<'_>) {
        match verbosity {
            Verbosity::Debug => log::debug!("{}", message),
            Verbosity::Info => log::info!("{}", message),
            Verbosity::Warn => log::warn!("{}", message),
            Verbosity::Error => log::error!("{}", message),
        }
    }
}

fn context_id_width(bytes: u8) -> Result<ContextIdWidth> {
    match bytes {
        0 => Ok(ContextIdWidth::B0),
        1 => Ok(ContextIdWidth::B1),
        2 => Ok(ContextIdWidth::B2),
        4 => Ok(ContextIdWidth::B4),
        other => anyhow::bail!("--context-id-width must be 0, 1, 2 or 4, got {}", other),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let opt = Opt::from_args();

    let options = DecoderOptions {
        protocol: if opt.mtb { Protocol::Mtb } else { Protocol::Etm35 },
        etm: EtmConfig {
            using_alt_addr_encode: opt.alt_addr_encode,
            context_id_width: context_id_width(opt.context_id_width)?,
            cycle_accurate: opt.cycle_accurate,
            data_only_mode: opt.data_only,
        },
    };

    let data = fs::read(&opt.file)
        .with_context(|| format!("failed to read trace capture {}", opt.file.display()))?;

    let mut decoder = Decoder::new(options);
    let mut printer = Printer;
    decoder.pump(&data, &mut printer);

    if !decoder.is_synced() {
        log::warn!("decoder never synchronised on this capture");
    }
    let stats = decoder.stats();
    log::info!(
        "sync_count={} lost_sync_count={}",
        stats.sync_count,
        stats.lost_sync_count
    );

    Ok(())
}
