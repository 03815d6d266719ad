use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracebt_core::{
    Backtrace, FrameDescription, FrameOverrides, FrameSink, Snapshot, UnwindConfig, Unwinder,
};
use tracebt_listing::parse_address;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tracebt",
    about = "Unwind an ARM/Thumb stack by tracing instructions from a target snapshot."
)]
struct Args {
    /// Snapshot JSON to unwind; reads stdin when omitted or `-`.
    #[arg(value_name = "SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Start from this PC instead of the snapshot's (hex or decimal).
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    pc: Option<u32>,

    /// Start from this SP instead of the snapshot's (hex or decimal).
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    sp: Option<u32>,

    /// Force Thumb (`--thumb`) or ARM (`--thumb false`) decoding of the
    /// first frame.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    thumb: Option<bool>,

    /// JSON file with unwinder settings; the flags below override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Bytes disassembled per cache miss.
    #[arg(long, value_name = "BYTES", value_parser = parse_number)]
    block_size: Option<u32>,

    /// Instructions dropped from the end of each disassembled window.
    #[arg(long, value_name = "N")]
    tail_margin: Option<usize>,

    /// Decoded ranges kept before the oldest is evicted.
    #[arg(long, value_name = "N")]
    max_ranges: Option<usize>,

    /// Warnings tolerated per unwind step before giving up.
    #[arg(long, value_name = "N")]
    warning_limit: Option<usize>,

    /// Stop after this many frames.
    #[arg(long, value_name = "N")]
    max_frames: Option<usize>,

    /// Emit the frames as a JSON array instead of text.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Record frame N as the selected frame and print it last.
    #[arg(long, value_name = "N")]
    select: Option<usize>,

    /// Log more (-v info, -vv debug, -vvv trace); RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Serialize)]
struct FrameRecord {
    index: usize,
    pc: String,
    sp: String,
    mode: String,
    function: String,
    library: String,
}

impl FrameRecord {
    fn new(index: usize, desc: &FrameDescription, mode: tracebt_core::Mode) -> Self {
        Self {
            index,
            pc: format!("{:#x}", desc.pc),
            sp: format!("{:#x}", desc.sp),
            mode: mode.to_string(),
            function: desc.function.clone(),
            library: desc.library.clone(),
        }
    }
}

fn parse_number(raw: &str) -> Result<u32, String> {
    parse_address(raw).map_err(|err| err.to_string())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<UnwindConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("open config {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => UnwindConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(tail_margin) = args.tail_margin {
        config.tail_margin = tail_margin;
    }
    if let Some(max_ranges) = args.max_ranges {
        config.max_ranges = max_ranges;
    }
    if let Some(warning_limit) = args.warning_limit {
        config.warning_limit = warning_limit;
    }
    if let Some(max_frames) = args.max_frames {
        config.max_frames = max_frames;
    }
    Ok(config.normalized())
}

fn load_snapshot(path: Option<&PathBuf>) -> Result<Snapshot> {
    match path {
        Some(path) if path.as_os_str() != "-" => tracebt_core::load_snapshot(path)
            .with_context(|| format!("load snapshot {}", path.display())),
        _ => Snapshot::from_reader(io::stdin().lock()).context("read snapshot from stdin"),
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let mut snapshot = load_snapshot(args.snapshot.as_ref())?;
    let overrides = FrameOverrides {
        pc: args.pc,
        sp: args.sp,
        thumb: args.thumb,
    };

    // Snapshots are in-memory, so Ctrl-C simply ends the process. Hosts that
    // drive a live target hold `Unwinder::cancel_flag` and set it instead.
    let mut unwinder = Unwinder::new(snapshot.instruction_source(), config);
    let mut frames = Vec::new();
    let mut records = Vec::new();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut backtrace =
        Backtrace::new(&mut unwinder, &mut snapshot, overrides).context("read initial frame")?;
    let outcome = loop {
        match backtrace.next_frame() {
            Ok(Some(frame)) => {
                let index = frames.len();
                let desc = frame.describe(backtrace.target_mut());
                if args.json {
                    records.push(FrameRecord::new(index, &desc, frame.mode()));
                } else {
                    writeln!(out, "#{index}: {desc}")?;
                    out.flush()?;
                }
                frames.push(frame);
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    drop(backtrace);

    if args.json {
        serde_json::to_writer_pretty(&mut out, &records)?;
        writeln!(out)?;
    } else if outcome.is_ok() {
        writeln!(out, "no more reachable frames")?;
    }

    if let Some(index) = args.select {
        let Some(frame) = frames.get(index) else {
            bail!("frame #{index} not found ({} frames)", frames.len());
        };
        snapshot
            .select_frame(frame)
            .with_context(|| format!("select frame #{index}"))?;
        if !args.json {
            writeln!(out, "selected #{index}: {}", frame.describe(&mut snapshot))?;
        }
    }

    outcome.context("unwind failed")
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    if let Err(err) = run(args) {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
