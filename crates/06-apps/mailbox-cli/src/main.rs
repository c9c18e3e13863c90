//! Command-line harness for the mailbox transport.
//!
//! Runs the host side, a simulated co-processor, or both against one shared
//! window. With `--shm` the window is a mapped file, so the two sides can
//! live in separate processes.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mailbox_io::{
    Direction, Fd, Mailbox, MailboxConfig, MailboxError, RegionMemory, RingLayout, ServiceHook,
    SharedMemory, Side, WakeHook, WakeLine, WellKnown, Yield,
};
use mailbox_stream::MailboxStream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Text rendering helpers used by the CLI commands.
mod render {
    use super::{ChannelRow, ConsoleReport, EchoReport};
    use std::fmt::Write;

    /// Format the channel table for one side.
    pub fn layout(window_len: usize, rows: &[ChannelRow]) -> String {
        let mut out = String::new();
        writeln!(out, "window {window_len:#x} bytes").expect("write header");
        writeln!(out, "fd  name         base    capacity  direction").expect("write columns");
        for row in rows {
            writeln!(
                out,
                "{:<3} {:<12} {:#06x}  {:<8}  {}",
                row.fd.raw(),
                row.name,
                row.ring.base(),
                row.ring.capacity(),
                row.direction
            )
            .expect("write row");
        }
        out
    }

    /// Summarise an echo run.
    pub fn echo(report: &EchoReport) -> String {
        format!(
            "echoed {} bytes in {} writes ({} short), verified\n",
            report.bytes, report.writes, report.short_writes
        )
    }

    /// Summarise a console run.
    pub fn console(report: &ConsoleReport) -> String {
        format!(
            "received {} lines ({} bytes), {} wake pulses\n",
            report.lines, report.bytes, report.pulses
        )
    }
}

/// Exercise mailbox channels between a host and a co-processor.
#[derive(Parser, Debug)]
#[command(author, version, about = "Drive mailbox channels over a shared window", long_about = None)]
struct Cli {
    /// JSON file overriding the default channel layout.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Map this file as the shared window instead of private memory.
    #[arg(long, value_name = "PATH")]
    shm: Option<PathBuf>,

    /// Give up on blocked transfers after this many milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the well-known channel table.
    Layout {
        #[arg(value_enum, long, default_value_t = SideArg::Host)]
        side: SideArg,
    },
    /// Stream a pattern through rpc-in, echo it back on rpc-out, and verify.
    Echo {
        /// Which sides this process runs.
        #[arg(value_enum, long, default_value_t = Role::Both)]
        role: Role,
        /// Bytes to send (decimal or hex).
        #[arg(long, value_parser = parse_usize, default_value = "65536")]
        bytes: usize,
        /// Largest single write.
        #[arg(long, value_parser = parse_usize, default_value = "256")]
        chunk: usize,
        /// Seed for the pattern and chunk sizes.
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Print lines from a simulated co-processor, sleeping on the wake line.
    Console {
        /// Lines the co-processor prints.
        #[arg(long, default_value_t = 8)]
        lines: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SideArg {
    Host,
    Coproc,
}

impl From<SideArg> for Side {
    fn from(arg: SideArg) -> Self {
        match arg {
            SideArg::Host => Side::Host,
            SideArg::Coproc => Side::CoProcessor,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Host and co-processor on two threads of this process.
    Both,
    /// Host only; the co-processor attaches to the same `--shm` file.
    Host,
    /// Co-processor only.
    Coproc,
}

type Window = Arc<RegionMemory>;

/// One line of the channel table.
struct ChannelRow {
    fd: Fd,
    name: &'static str,
    ring: RingLayout,
    direction: &'static str,
}

#[derive(Debug, PartialEq, Eq)]
struct EchoReport {
    bytes: usize,
    writes: usize,
    short_writes: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct ConsoleReport {
    lines: usize,
    bytes: usize,
    pulses: u32,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ms) = cli.timeout_ms {
        config.wait.timeout_ms = Some(ms);
    }
    config.validate().context("invalid mailbox configuration")?;

    match cli.command {
        Command::Layout { side } => {
            let rows = channel_rows(&config, side.into())?;
            print!("{}", render::layout(config.window_len, &rows));
        }
        Command::Echo {
            role,
            bytes,
            chunk,
            seed,
        } => {
            if role != Role::Both && cli.shm.is_none() {
                bail!("--role {role:?} needs --shm so the other side can attach");
            }
            let memory = open_window(&config, cli.shm.as_deref())?;
            if let Some(report) = run_echo(&config, memory, role, bytes, chunk, seed)? {
                print!("{}", render::echo(&report));
            }
        }
        Command::Console { lines } => {
            let memory = open_window(&config, cli.shm.as_deref())?;
            let report = run_console(&config, memory, lines)?;
            print!("{}", render::console(&report));
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<MailboxConfig> {
    let Some(path) = path else {
        return Ok(MailboxConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: MailboxConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    debug!(?config, "loaded config");
    Ok(config)
}

fn open_window(config: &MailboxConfig, shm: Option<&Path>) -> Result<Window> {
    let memory = match shm {
        Some(path) => RegionMemory::map_file(path, config.window_len)
            .with_context(|| format!("failed to map shared window {}", path.display()))?,
        None => RegionMemory::new(config.window_len).context("failed to allocate shared window")?,
    };
    Ok(Arc::new(memory))
}

fn channel_rows(config: &MailboxConfig, side: Side) -> Result<Vec<ChannelRow>> {
    WellKnown::ALL
        .iter()
        .map(|&channel| -> Result<ChannelRow> {
            Ok(ChannelRow {
                fd: Fd::well_known(channel),
                name: channel.name(),
                ring: config.well_known_ring(channel)?,
                direction: match side.direction_of(channel) {
                    Direction::Producer => "write",
                    Direction::Consumer => "read",
                },
            })
        })
        .collect()
}

fn run_echo(
    config: &MailboxConfig,
    memory: Window,
    role: Role,
    bytes: usize,
    chunk: usize,
    seed: u64,
) -> Result<Option<EchoReport>> {
    if chunk == 0 {
        bail!("chunk size must be at least one byte");
    }
    match role {
        Role::Coproc => {
            let coproc = Mailbox::new(memory, Side::CoProcessor, config.clone())?;
            let echoed = echo_server(&coproc)?;
            info!(echoed, "co-processor finished");
            Ok(None)
        }
        Role::Host => {
            let host = Mailbox::new(memory, Side::Host, config.clone())?;
            echo_client(&host, bytes, chunk, seed).map(Some)
        }
        Role::Both => {
            let host = Mailbox::new(Arc::clone(&memory), Side::Host, config.clone())?;
            let coproc = Mailbox::new(memory, Side::CoProcessor, config.clone())?;
            let server = thread::spawn(move || echo_server(&coproc));
            let report = echo_client(&host, bytes, chunk, seed)?;
            server
                .join()
                .map_err(|_| anyhow!("co-processor thread panicked"))??;
            Ok(Some(report))
        }
    }
}

/// Co-processor half: reads a `u32` byte count, then echoes that many bytes.
fn echo_server<M: SharedMemory>(coproc: &Mailbox<M>) -> Result<usize> {
    let total = MailboxStream::rpc(coproc)?
        .with_hook(Yield)
        .read_u32()? as usize;
    debug!(total, "echo request");
    let mut buf = [0u8; 512];
    let mut echoed = 0;
    while echoed < total {
        let want = buf.len().min(total - echoed);
        let n = coproc.read_with(Fd::RPC_IN, &mut buf[..want], &mut Yield)?;
        coproc.write_all_with(Fd::RPC_OUT, &buf[..n], &mut Yield)?;
        echoed += n;
    }
    Ok(echoed)
}

/// Drains the echo channel while the host waits for room on rpc-in, so
/// neither side can end up blocked on a full ring.
struct DrainEcho<'a, M> {
    host: &'a Mailbox<M>,
    received: Vec<u8>,
    error: Option<MailboxError>,
}

impl<M: SharedMemory> DrainEcho<'_, M> {
    fn pull(&mut self) -> Result<(), MailboxError> {
        let mut buf = [0u8; 256];
        let n = self.host.try_read(Fd::RPC_OUT, &mut buf)?;
        self.received.extend_from_slice(&buf[..n]);
        Ok(())
    }
}

impl<M: SharedMemory> ServiceHook for DrainEcho<'_, M> {
    fn service(&mut self) {
        if self.error.is_none() {
            if let Err(err) = self.pull() {
                self.error = Some(err);
            }
        }
        thread::yield_now();
    }
}

/// Host half: sends the byte count, then the pattern in random chunk sizes,
/// and checks the echo.
fn echo_client<M: SharedMemory>(
    host: &Mailbox<M>,
    bytes: usize,
    chunk: usize,
    seed: u64,
) -> Result<EchoReport> {
    let total = u32::try_from(bytes).context("echo length must fit in 32 bits")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let pattern: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    MailboxStream::rpc(host)?.with_hook(Yield).write_u32(total)?;

    let started = Instant::now();
    let mut drain = DrainEcho {
        host,
        received: Vec::with_capacity(bytes),
        error: None,
    };
    let mut report = EchoReport {
        bytes,
        writes: 0,
        short_writes: 0,
    };
    let mut sent = 0;
    while sent < bytes {
        let want = rng.gen_range(1..=chunk).min(bytes - sent);
        let n = host.write_with(Fd::RPC_IN, &pattern[sent..sent + want], &mut drain)?;
        if let Some(err) = drain.error.take() {
            return Err(err).context("draining echo channel");
        }
        report.writes += 1;
        if n < want {
            report.short_writes += 1;
        }
        sent += n;
    }

    let mut received = drain.received;
    while received.len() < bytes {
        let start = received.len();
        received.resize(bytes, 0);
        let n = host.read_with(Fd::RPC_OUT, &mut received[start..], &mut Yield)?;
        received.truncate(start + n);
    }
    if received != pattern {
        let at = received
            .iter()
            .zip(&pattern)
            .position(|(a, b)| a != b)
            .unwrap_or(bytes);
        bail!("echo diverged at byte {at}");
    }
    info!(
        bytes,
        writes = report.writes,
        short = report.short_writes,
        elapsed = ?started.elapsed(),
        "echo verified"
    );
    Ok(report)
}

/// The co-processor prints `lines` lines on its console while the host sleeps
/// on the wake line between them.
fn run_console(config: &MailboxConfig, memory: Window, lines: usize) -> Result<ConsoleReport> {
    let line = Arc::new(WakeLine::new());
    let host = Mailbox::new(Arc::clone(&memory), Side::Host, config.clone())?;
    let coproc = Mailbox::with_signal(memory, Side::CoProcessor, config.clone(), Arc::clone(&line))?;

    let printer = thread::spawn(move || -> Result<(), MailboxError> {
        for idx in 0..lines {
            thread::sleep(Duration::from_millis(2));
            for byte in format!("co-processor line {idx}\n").bytes() {
                coproc.outbyte(byte)?;
            }
        }
        Ok(())
    });

    let mut hook = WakeHook::new(Arc::clone(&line));
    let mut text = Vec::new();
    let mut buf = [0u8; 128];
    let mut seen = 0;
    while seen < lines {
        let n = host.read_with(host.console_reader(), &mut buf, &mut hook)?;
        seen += buf[..n].iter().filter(|b| **b == b'\n').count();
        text.extend_from_slice(&buf[..n]);
    }
    printer
        .join()
        .map_err(|_| anyhow!("co-processor thread panicked"))??;

    print!("{}", String::from_utf8_lossy(&text));
    Ok(ConsoleReport {
        lines: seen,
        bytes: text.len(),
        pulses: line.epoch(),
    })
}

fn parse_usize(input: &str) -> Result<usize, String> {
    mailbox_io::parse_base(input).ok_or_else(|| format!("invalid number '{input}'"))
}
