use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::error;

use cachesim_dir::config::WorkloadConfig;
use cachesim_dir::{run, Config, Protocol};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WorkloadKind {
    SpinlockCounter,
    SharedCounter,
    FalseSharing,
    RandomArray,
}

#[derive(Parser, Debug)]
#[command(version, about = "Directory-based cache coherence simulator (MSI, TARDIS)")]
struct Cli {
    /// TOML configuration file, overridden by CACHESIM_* variables and flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MSI or TARDIS
    #[arg(short, long)]
    protocol: Option<Protocol>,

    #[arg(long)]
    cpus: Option<usize>,

    #[arg(long)]
    dirs: Option<usize>,

    /// L1 size in bytes
    #[arg(long)]
    cache_size: Option<u64>,

    #[arg(long)]
    assoc: Option<usize>,

    /// line size in bytes
    #[arg(long)]
    line_size: Option<u64>,

    #[arg(short, long, value_enum)]
    workload: Option<WorkloadKind>,

    #[arg(short, long)]
    iterations: Option<u64>,

    /// seed of the random-array workload
    #[arg(long)]
    seed: Option<u64>,

    /// trace files, one per cpu
    #[arg(long, num_args = 1..)]
    trace: Vec<PathBuf>,

    #[arg(long)]
    max_cycles: Option<u64>,

    /// skip the runtime coherence checks
    #[arg(long)]
    no_check: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(p) = self.protocol {
            config.protocol = p;
        }
        if let Some(n) = self.cpus {
            config.num_cpus = n;
        }
        if let Some(n) = self.dirs {
            config.num_dirs = n;
        }
        if let Some(size) = self.cache_size {
            config.cache.size = size;
        }
        if let Some(assoc) = self.assoc {
            config.cache.assoc = assoc;
        }
        if let Some(size) = self.line_size {
            config.cache.line_size = size;
        }
        if let Some(max) = self.max_cycles {
            config.max_cycles = max;
        }
        if self.no_check {
            config.check_coherence = false;
        }

        if !self.trace.is_empty() {
            config.workload = WorkloadConfig::Trace { files: self.trace.clone() };
            return;
        }
        if let Some(kind) = self.workload {
            let iterations = 100;
            config.workload = match kind {
                WorkloadKind::SpinlockCounter => WorkloadConfig::SpinlockCounter { iterations },
                WorkloadKind::SharedCounter => WorkloadConfig::SharedCounter { iterations },
                WorkloadKind::FalseSharing => WorkloadConfig::FalseSharing { iterations },
                WorkloadKind::RandomArray => WorkloadConfig::RandomArray { elements: 4096, iterations, seed: 0 },
            };
        }
        match &mut config.workload {
            WorkloadConfig::SpinlockCounter { iterations }
            | WorkloadConfig::SharedCounter { iterations }
            | WorkloadConfig::FalseSharing { iterations } => {
                *iterations = self.iterations.unwrap_or(*iterations);
            }
            WorkloadConfig::RandomArray { iterations, seed, .. } => {
                *iterations = self.iterations.unwrap_or(*iterations);
                *seed = self.seed.unwrap_or(*seed);
            }
            WorkloadConfig::Trace { .. } => {}
        }
    }
}

fn main() -> ExitCode {
    // logging
    let env = Env::default()
        .filter_or("CACHESIM_LOG", "info")
        .write_style_or("CACHESIM_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    let cli = Cli::parse();
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    match run(&config) {
        Ok(report) => {
            println!("{report}");
            if report.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
