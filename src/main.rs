//! Chancache CLI
//!
//! Entry point for the `chancache` command-line tool.

use clap::{Parser, Subcommand};
use chancache::signal::{self, SignalState};
use chancache::{inspect, ChanCacher, ChanCacherConfig, FileConfig};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "chancache")]
#[command(about = "Bounded channel pipeline with disk overflow", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pipe newline-delimited JSON from stdin to stdout through a chancacher
    Pipe {
        /// Path to config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Cache directory (overrides config; spilling is off without one)
        #[arg(long, short = 'd')]
        cache_dir: Option<PathBuf>,

        /// In-memory buffer depth (overrides config)
        #[arg(long)]
        depth: Option<usize>,

        /// Maximum bytes on disk, 0 for unlimited (overrides config)
        #[arg(long)]
        max_size: Option<u64>,
    },

    /// Report what a cache directory holds
    Inspect {
        /// Cache directory
        dir: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Pipe {
            config,
            cache_dir,
            depth,
            max_size,
        } => run_pipe(config, cache_dir, depth, max_size),
        Commands::Inspect { dir, json } => run_inspect(dir, json),
    };
    process::exit(code);
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // stdout carries data
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Why the stdin pump stopped.
enum Stop {
    Eof,
    Interrupted,
    Writer(Drained),
}

/// Why the stdout writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drained {
    /// The output closed with every value written.
    Closed,
    Interrupted,
    Failed,
}

fn run_pipe(
    config_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    depth: Option<usize>,
    max_size: Option<u64>,
) -> i32 {
    let mut file_config = match config_path {
        Some(path) => match FileConfig::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                return 1;
            }
        },
        None => FileConfig::default(),
    };

    if let Some(dir) = cache_dir {
        file_config.cache.cache_dir = Some(dir);
    }
    if let Some(depth) = depth {
        file_config.cache.depth = depth;
    }
    if let Some(max_size) = max_size {
        file_config.cache.max_size = max_size;
    }

    init_logging(&file_config.log.level);

    let signals = Arc::new(SignalState::new());
    if let Err(e) = signal::install(Arc::clone(&signals)) {
        warn!(error = %e, "failed to install signal handlers");
    }
    let shutdown = signals.shutdown().receiver().clone();

    run_pipeline(file_config.cache, &shutdown)
}

fn run_pipeline(config: ChanCacherConfig, shutdown: &Receiver<()>) -> i32 {
    let spilling = config.cache_path().is_some();
    let mut cacher = match ChanCacher::<Value>::new(config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to start chancacher");
            return 1;
        }
    };

    let Some(input) = cacher.sender() else {
        return 1;
    };
    cacher.close_input();

    let (line_tx, line_rx) = bounded::<Value>(0);
    thread::spawn(move || read_stdin(line_tx));

    let (done_tx, done_rx) = bounded::<Drained>(1);
    {
        let output = cacher.output().clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            let _ = done_tx.send(write_stdout(&output, &shutdown));
        });
    }

    let drained = match pump(&line_rx, input, shutdown, &done_rx) {
        Stop::Eof => {
            debug!("stdin closed, waiting for output to drain");
            select! {
                recv(done_rx) -> res => res.unwrap_or(Drained::Failed),
                recv(shutdown) -> _ => Drained::Interrupted,
            }
        }
        Stop::Interrupted => Drained::Interrupted,
        Stop::Writer(drained) => drained,
    };

    if drained == Drained::Closed {
        info!("all values delivered");
        return 0;
    }

    cacher.commit();
    if spilling {
        info!(bytes = cacher.size(), "pending values committed to disk");
    } else if cacher.buffer_size() > 0 {
        warn!(
            lost = cacher.buffer_size(),
            "no cache directory, dropping buffered values"
        );
    }

    match drained {
        Drained::Failed => 1,
        _ => 0,
    }
}

/// Move parsed lines into the chancacher until stdin closes or something
/// asks us to stop. Dropping `input` on return closes the pipeline input.
fn pump(
    lines: &Receiver<Value>,
    input: Sender<Value>,
    shutdown: &Receiver<()>,
    writer_done: &Receiver<Drained>,
) -> Stop {
    loop {
        let value = select! {
            recv(lines) -> msg => match msg {
                Ok(v) => v,
                Err(_) => return Stop::Eof,
            },
            recv(shutdown) -> _ => return Stop::Interrupted,
            recv(writer_done) -> res => return Stop::Writer(res.unwrap_or(Drained::Failed)),
        };

        select! {
            send(input, value) -> res => {
                if res.is_err() {
                    return Stop::Writer(Drained::Failed);
                }
            }
            recv(shutdown) -> _ => {
                warn!("interrupted while sending, dropping one value");
                return Stop::Interrupted;
            }
        }
    }
}

fn read_stdin(lines: Sender<Value>) {
    let stdin = io::stdin();
    for (n, line) in stdin.lock().lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(v) => {
                if lines.send(v).is_err() {
                    return;
                }
            }
            Err(e) => warn!(line = n + 1, error = %e, "skipping invalid JSON line"),
        }
    }
}

fn write_stdout(output: &Receiver<Value>, shutdown: &Receiver<()>) -> Drained {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    loop {
        select! {
            recv(output) -> msg => match msg {
                Ok(v) => {
                    let res = serde_json::to_writer(&mut out, &v)
                        .map_err(io::Error::from)
                        .and_then(|_| writeln!(out))
                        .and_then(|_| out.flush());
                    if let Err(e) = res {
                        error!(error = %e, "failed to write to stdout");
                        return Drained::Failed;
                    }
                }
                Err(_) => return Drained::Closed,
            },
            recv(shutdown) -> _ => return Drained::Interrupted,
        }
    }
}

fn run_inspect(dir: PathBuf, json: bool) -> i32 {
    init_logging("warn");

    let report = match inspect::<Value>(&dir) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error inspecting cache: {}", e);
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return 1;
            }
        }
    } else {
        print!("{}", report);
    }

    if report.is_healthy() {
        0
    } else {
        2
    }
}
