use std::{
    error::Error,
    ffi::OsString,
    fs,
    io::{self, BufWriter},
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
};

use cachesim::{memory, trace, CacheConfig, FlatMemory, Simulator, Trace};
use log::error;

const USAGE: &str = "usage: cachesim <trace> <size-kb> <ways> <block-size> \
[--json <path>] [--mem-bits <n>] [--buffer-size <n>] [--queue-size <n>]
       cachesim <trace> (--config <json> | -p <path>) [options]";

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = pico_args::Arguments::from_env();
    let stats_path: Option<PathBuf> = args.opt_value_from_os_str("--json", |s| {
        Ok::<_, std::convert::Infallible>(PathBuf::from(s))
    })?;
    let mem_bits: u32 = args
        .opt_value_from_str("--mem-bits")?
        .unwrap_or(memory::DEFAULT_MEMORY_BITS);
    let records_per_batch: usize = args
        .opt_value_from_str("--buffer-size")?
        .unwrap_or(trace::RECORDS_PER_BATCH);
    let batches_per_queue: usize = args
        .opt_value_from_str("--queue-size")?
        .unwrap_or(trace::BATCHES_PER_QUEUE);

    let config_str: Option<String> = if let Some(config_str) = args.opt_value_from_str("--config")? {
        Some(config_str)
    } else if let Some(config_path) = args.opt_value_from_str::<_, String>("-p")? {
        Some(fs::read_to_string(&config_path).map_err(|e| format!("{config_path}: {e}"))?)
    } else {
        None
    };

    let free = args.finish();
    let config = match (config_str, free.as_slice()) {
        (Some(config_str), [_trace]) => serde_json::from_str(&config_str)?,
        (None, [_trace, size_kb, ways, block_size]) => CacheConfig {
            size_kb: positional(size_kb, "cache size")?,
            ways: positional(ways, "associativity")?,
            block_size: positional(block_size, "block size")?,
        },
        _ => return Err(format!("wrong number of arguments\n{USAGE}").into()),
    };
    let trace_path = PathBuf::from(&free[0]);

    let geometry = config.geometry()?;
    let memory = FlatMemory::new(mem_bits)?;
    let mut sim = Simulator::new(geometry, memory)?;
    let trace = Trace::read(trace_path, records_per_batch, batches_per_queue)?;

    let stdout = io::stdout();
    sim.run(trace, BufWriter::new(stdout.lock()))?;

    if let Some(stats_path) = stats_path {
        let stats_file = fs::File::create(&stats_path)
            .map_err(|e| format!("{}: {e}", stats_path.display()))?;
        serde_json::to_writer_pretty(stats_file, &sim.cache().stats())?;
    }
    Ok(())
}

fn positional<T: FromStr>(arg: &OsString, what: &str) -> Result<T, String> {
    arg.to_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("{what} must be a number, got {arg:?}"))
}
