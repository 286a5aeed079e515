//! Purpose: `logcache` CLI entry point: cache benchmarks and read-only cache file inspection.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
//! Invariants: `inspect` never modifies or deletes the file it reads.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use logcache::cache_paths::default_cache_dir;
use logcache::core::cache_file::read_file_range;
use logcache::core::error::{Error, ErrorKind, to_exit_code};

mod bench;

use bench::{BenchArgs, BenchFormat, run_bench};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    let cache_dir = cli.dir.unwrap_or_else(default_cache_dir);
    match cli.command {
        Command::Bench {
            generations,
            variables,
            samples,
            limit,
            keep,
            memory,
            format,
        } => {
            let args = BenchArgs {
                work_dir: cache_dir,
                generations,
                variables,
                samples,
                generation_limit: limit,
                keep,
                cache_to_disk: !memory,
                format: BenchFormat::parse(&format)?,
            };
            run_bench(args, env!("CARGO_PKG_VERSION"))?;
        }
        Command::Inspect { file, start, len } => {
            let (range, values) = read_file_range(&file, start, len)?;
            emit_json(json!({
                "path": file.display().to_string(),
                "start_byte": range.start_byte,
                "num_bytes": range.num_bytes,
                "values": values,
            }));
        }
    }
    Ok(RunOutcome::ok())
}

#[derive(Parser)]
#[command(
    name = "logcache",
    version,
    about = "Disk-backed generation cache for logged simulation data",
    long_about = None,
    after_help = r#"EXAMPLES
  $ logcache bench --generations 20 --limit 5 --keep 2
  $ logcache bench --memory --format table
  $ logcache inspect /tmp/logcache/handler0/cf3 --start 16 --len 32

Set RUST_LOG=debug to trace cache file creation and removal."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Base cache directory (default: <temp>/logcache)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Log simulated generations through a handler and report timings")]
    Bench {
        #[arg(long, default_value_t = 10, help = "Generations to log")]
        generations: u32,
        #[arg(long, default_value_t = 8, help = "Variables per generation")]
        variables: usize,
        #[arg(long, default_value_t = 4096, help = "Samples per variable")]
        samples: usize,
        #[arg(long, default_value_t = 100, help = "Generation limit per variable")]
        limit: usize,
        #[arg(long, value_delimiter = ',', help = "Generations to protect from auto-removal")]
        keep: Vec<i32>,
        #[arg(long, help = "Keep all data in memory instead of cache files")]
        memory: bool,
        #[arg(long, default_value = "json", help = "Output format: json|table|both")]
        format: String,
    },
    #[command(about = "Print the f64 values stored in a byte range of a cache file")]
    Inspect {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, default_value_t = 0, help = "First byte to read")]
        start: u64,
        #[arg(long, help = "Bytes to read (default: to end of file)")]
        len: Option<u64>,
    },
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {err}");
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::SizeMismatch => "vector size changed while checked out".to_string(),
        ErrorKind::IndexOutOfRange => "index out of range".to_string(),
        ErrorKind::NotCheckedOut => "vector is not checked out".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    if let Some(generation) = err.generation() {
        inner.insert("generation".to_string(), json!(generation));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
