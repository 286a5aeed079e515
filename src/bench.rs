// Benchmark harness for logcache.
//
// Purpose:
// - Simulate repeated runs: log N generations of M variables x K samples through a handler.
// - Exercise retention (generation limit plus kept generations) and whole-vector transforms.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Runs in-process against a handler directory under the work dir; the handler cleans up on drop.
// - Verifies a sample of the transformed data so the numbers are not measured on broken output.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use logcache::core::error::{Error, ErrorKind};
use logcache::handler::{LogCacheConfig, LogDataHandler};

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub work_dir: PathBuf,
    pub generations: u32,
    pub variables: usize,
    pub samples: usize,
    pub generation_limit: usize,
    pub keep: Vec<i32>,
    pub cache_to_disk: bool,
    pub format: BenchFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

impl BenchFormat {
    pub fn parse(input: &str) -> Result<Self, Error> {
        match input.trim() {
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            "both" => Ok(Self::Both),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("invalid --format (use json|table|both)")),
        }
    }
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    let output = collect_bench(&args, program_version)?;
    emit_bench_output(output, args.format)
}

fn collect_bench(args: &BenchArgs, program_version: &str) -> Result<Value, Error> {
    if args.variables == 0 || args.samples == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--variables and --samples must be at least 1"));
    }
    let start = SystemTime::now();
    let config = LogCacheConfig::default()
        .with_cache_dir(&args.work_dir)
        .with_cache_to_disk(args.cache_to_disk)
        .with_generation_limit(args.generation_limit);
    let mut handler = LogDataHandler::new(config)?;
    let names: Vec<String> = (0..args.variables).map(variable_name).collect();

    let mut log_time = Duration::ZERO;
    let mut transform_time = Duration::ZERO;
    let mut peak_cache_files = 0;
    for _ in 0..args.generations {
        let began = Instant::now();
        let generation = handler.begin_generation()?;
        for (idx, name) in names.iter().enumerate() {
            handler.insert_variable(name, samples_for(generation, idx, args.samples))?;
        }
        if args.keep.contains(&generation) {
            handler.prevent_generation_auto_removal(generation);
        }
        handler.end_generation()?;
        log_time += began.elapsed();
        peak_cache_files = peak_cache_files.max(count_cache_files(&handler));

        let began = Instant::now();
        negate_generation(&handler, &names, generation)?;
        transform_time += began.elapsed();
    }

    let began = Instant::now();
    let mut elements_read = 0u64;
    for generation in handler.generation_numbers() {
        for name in &names {
            if let Some(variable) = handler.variable(name, generation) {
                elements_read += variable.to_vec()?.len() as u64;
            }
        }
    }
    let read_time = began.elapsed();
    verify(&handler, &names)?;

    let elements = u64::from(args.generations) * (args.variables * args.samples) as u64;
    let results = vec![
        result_entry("log", elements, log_time),
        result_entry("transform", elements, transform_time),
        result_entry("read", elements_read, read_time),
    ];
    let kept: Vec<i32> = args
        .keep
        .iter()
        .copied()
        .filter(|kept| handler.generation_numbers().contains(kept))
        .collect();

    Ok(json!({
        "name": "logcache",
        "version": program_version,
        "ts": rfc3339_now(start),
        "system": system_json(),
        "params": {
            "generations": args.generations,
            "variables": args.variables,
            "samples": args.samples,
            "generation_limit": args.generation_limit,
            "keep": args.keep,
            "cache_to_disk": args.cache_to_disk,
            "work_dir": args.work_dir.display().to_string(),
            "debug_build": cfg!(debug_assertions),
        },
        "results": results,
        "final": {
            "generations": handler.generation_numbers(),
            "kept": kept,
            "cache_files": count_cache_files(&handler),
            "peak_cache_files": peak_cache_files,
        },
    }))
}

fn negate_generation(handler: &LogDataHandler, names: &[String], generation: i32) -> Result<(), Error> {
    let cache = handler.generation_cache(generation);
    if let Some(cache) = &cache {
        cache.begin_multi_read_write()?;
    }
    let result = names.iter().try_for_each(|name| {
        let Some(variable) = handler.variable(name, generation) else {
            return Ok(());
        };
        let mut data = variable.data_mut()?;
        let mut op = data.begin_full_vector_operation()?;
        op.iter_mut().for_each(|value| *value = -*value);
        op.finish()
    });
    if let Some(cache) = &cache {
        cache.end_multi_read_write();
    }
    result
}

fn verify(handler: &LogDataHandler, names: &[String]) -> Result<(), Error> {
    for generation in handler.generation_numbers() {
        for (idx, name) in names.iter().enumerate() {
            let Some(variable) = handler.variable(name, generation) else {
                continue;
            };
            let last = variable.size().saturating_sub(1);
            let expected = -sample_value(generation, idx, last);
            let actual = variable.peek(last)?;
            if actual.to_bits() != expected.to_bits() {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message(format!(
                        "bench verification failed for {name}: expected {expected}, found {actual}"
                    ))
                    .with_generation(generation));
            }
        }
    }
    Ok(())
}

fn count_cache_files(handler: &LogDataHandler) -> usize {
    (0..=handler.current_generation().unwrap_or(-1))
        .filter_map(|generation| handler.generation_cache(generation))
        .filter(|cache| cache.path().exists())
        .count()
}

fn variable_name(idx: usize) -> String {
    format!("component{idx}.port.value")
}

fn sample_value(generation: i32, variable: usize, sample: usize) -> f64 {
    f64::from(generation) + variable as f64 * 0.25 + sample as f64 * 0.001
}

fn samples_for(generation: i32, variable: usize, samples: usize) -> Vec<f64> {
    (0..samples)
        .map(|sample| sample_value(generation, variable, sample))
        .collect()
}

fn emit_bench_output(value: Value, format: BenchFormat) -> Result<(), Error> {
    match format {
        BenchFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            Ok(())
        }
        BenchFormat::Table => emit_table(&value),
        BenchFormat::Both => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            emit_table(&value)
        }
    }
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let mut stderr = io::stderr().lock();
    let write_err = |err: io::Error| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write bench table")
            .with_source(err)
    };
    writeln!(stderr, "logcache bench (table)").map_err(write_err)?;

    let results = value
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;

    writeln!(
        stderr,
        "{:>10}  {:>12}  {:>12}  {:>12}  {:>10}",
        "bench", "elements", "duration_ms", "ns/elem", "MiB/s"
    )
    .map_err(write_err)?;

    for item in results {
        let bench = item.get("bench").and_then(|v| v.as_str()).unwrap_or("?");
        let elements = item.get("elements").and_then(|v| v.as_u64()).unwrap_or(0);
        let duration_ms = item.get("duration_ms").and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
        let ns_per_elem = item.get("ns_per_element").and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
        let mb_per_sec = item.get("mb_per_sec").and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
        writeln!(
            stderr,
            "{:>10}  {:>12}  {:>12.3}  {:>12.1}  {:>10.1}",
            bench, elements, duration_ms, ns_per_elem, mb_per_sec
        )
        .map_err(write_err)?;
    }

    if let Some(generations) = value.pointer("/final/generations") {
        writeln!(stderr, "retained generations: {generations}").map_err(write_err)?;
    }
    Ok(())
}

fn result_entry(bench: &str, elements: u64, duration: Duration) -> Value {
    let dur_ms = duration.as_secs_f64() * 1000.0;
    let per = if elements == 0 { 1 } else { elements } as f64;
    let ns_per_element = duration.as_secs_f64() * 1e9 / per;
    let mb = (elements as f64 * 8.0) / (1024.0 * 1024.0);
    let secs = duration.as_secs_f64().max(1e-9);

    let mut map = BTreeMap::new();
    map.insert("bench".to_string(), json!(bench));
    map.insert("elements".to_string(), json!(elements));
    map.insert("duration_ms".to_string(), json!(dur_ms));
    map.insert("ns_per_element".to_string(), json!(ns_per_element));
    map.insert("mb_per_sec".to_string(), json!(mb / secs));
    Value::Object(map.into_iter().collect())
}

fn system_json() -> Value {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let nsec = dur.subsec_nanos();
    let tm = time::OffsetDateTime::from_unix_timestamp(secs).unwrap_or_else(|_| time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(nsec).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
