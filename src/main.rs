// MAXWELL v1.0.0 -- DYNAMIC HARDWARE PREFETCHER CONTROLLER
// WATCHES PER-CORE PMU COUNTERS AND DRAM BANDWIDTH, RE-PROGRAMS THE
// PER-MODULE PREFETCHER MSR EVERY TICK: A BANDWIDTH-GATED LADDER
// (HEUR) OR AN EPSILON-GREEDY/UCB BANDIT (MAB) PICKS THE SETTING.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use maxwell::config::{
    clamp_aggressiveness, clamp_interval, parse_core_range, parse_weights, Algorithm, BwMode,
    Config, DynamicSd, RewardKind, DEFAULT_BW_UTILIZATION, DEFAULT_CORES_PER_MODULE,
    DEFAULT_EPSILON, DEFAULT_EXPLORATION, DEFAULT_GAMMA, DEFAULT_SD_WINDOW,
};
use maxwell::error::ConfigError;
use maxwell::msr::{DevMsr, MsrBackend, ShadowMsr};
use maxwell::runtime::Engine;
use maxwell::topology;

#[derive(Parser)]
#[command(name = "maxwell")]
#[command(version)]
#[command(about = "MAXWELL -- DYNAMIC HARDWARE PREFETCHER CONTROLLER")]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,

    // CORES TO MONITOR, E.G. 8-15. DEFAULT: AUTO-DETECT ATOM E-CORES
    #[arg(short = 'c', long)]
    core: Option<String>,

    // FRACTION OF THE DMI THEORETICAL MAX USED AS THE TARGET
    #[arg(short = 'd', long, default_value_t = DEFAULT_BW_UTILIZATION)]
    ddrbw_auto: f64,

    // MEASURE THE TARGET WITH A SHORT STREAMING SELF-TEST
    #[arg(short = 't', long)]
    ddrbw_test: bool,

    // EXPLICIT TARGET IN MB/S (MAX ACHIEVABLE)
    #[arg(short = 'D', long)]
    ddrbw_set: Option<u32>,

    // TICK INTERVAL IN SECONDS, CLAMPED TO [0.0001, 60]
    #[arg(short = 'i', long, default_value_t = 1.0)]
    intervall: f64,

    // 0 = HEUR, 1 = HEUR_PRIO, 2 = MAB
    #[arg(short = 'A', long, default_value_t = 0)]
    alg: u32,

    // RETUNE AGGRESSIVENESS (0.1 - 5.0)
    #[arg(short = 'a', long, default_value_t = 1.0)]
    aggr: f64,

    // COMMA-SEPARATED CORE PRIORITIES 0-99, MISSING TAIL DEFAULTS TO 50
    #[arg(short = 'w', long, default_value = "")]
    weight: String,

    // LOG LEVEL 1-5 (5 = TRACE)
    #[arg(short = 'l', long, default_value_t = 3)]
    log: u32,

    // BANDIT HYPERPARAMETERS
    #[arg(long, default_value_t = DEFAULT_EPSILON)]
    epsilon: f64,
    #[arg(long, default_value_t = DEFAULT_GAMMA)]
    gamma: f64,
    #[arg(long, default_value_t = DEFAULT_EXPLORATION)]
    exploration: f64,

    // ARM TABLE: 0 = FULL 16-ARM MASK SPACE, 1 = COARSE 4-ARM LADDER
    #[arg(long, default_value_t = 0)]
    arms: usize,

    // REWARD: 0 = IPC, 1 = IPC/BANDWIDTH, 2 = SIGMA-PENALIZED IPC
    #[arg(long, default_value_t = 0)]
    reward: u32,

    // SIGMA CONTEXT: 0 = OFF, 1 = ON, 2 = STEP-GATED ARM CHANGES
    #[arg(long, default_value_t = 0)]
    dynamic_sd: u32,

    // SLIDING WINDOW LENGTH FOR THE SIGMA CONTEXT
    #[arg(long, default_value_t = DEFAULT_SD_WINDOW)]
    window: usize,

    // RNG SEED FOR REPRODUCIBLE EXPLORATION. DEFAULT: ENTROPY
    #[arg(long)]
    seed: Option<u64>,

    // CORES SHARING ONE PREFETCHER MSR
    #[arg(long, default_value_t = DEFAULT_CORES_PER_MODULE)]
    cores_per_module: usize,

    // RUN THE FULL LOOP AGAINST AN IN-MEMORY REGISTER FILE
    #[arg(long)]
    dry_run: bool,

    // DUMP THE FULL TICK LOG ON EXIT
    #[arg(long)]
    dump_log: bool,
}

#[derive(Subcommand)]
enum Cmd {
    // AUDIT MSR DEVICE, KERNEL CONFIG, TOPOLOGY, AND PROBE SUPPORT
    Check,
    // RUN THE BANDWIDTH PROBE STANDALONE, ONE LINE PER SAMPLE
    Probe {
        #[arg(short = 'c', long)]
        core: Option<String>,
        #[arg(short = 'i', long, default_value_t = 1.0)]
        intervall: f64,
    },
    // DRIVE THE IN-KERNEL HELPER (status|enable|disable)
    Helper {
        action: String,
        #[arg(short = 'c', long)]
        core: Option<String>,
        #[arg(short = 'D', long)]
        ddrbw_set: Option<u32>,
    },
}

fn log_level(flag: u32) -> tracing::Level {
    match flag {
        0 | 1 => tracing::Level::ERROR,
        2 => tracing::Level::WARN,
        3 => tracing::Level::INFO,
        4 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn resolve_cores(arg: &Option<String>) -> Result<(usize, usize)> {
    match arg {
        Some(range) => Ok(parse_core_range(range)?),
        None => Ok(topology::efficiency_cores()?),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.log))
        .with_target(false)
        .init();

    match &cli.command {
        Some(Cmd::Check) => return maxwell::cli::check::run_check(),
        Some(Cmd::Probe { core, intervall }) => {
            let cores = resolve_cores(core)?;
            return maxwell::cli::probe::run_probe(cores, clamp_interval(*intervall));
        }
        Some(Cmd::Helper {
            action,
            core,
            ddrbw_set,
        }) => {
            let cores = core.as_ref().map(|s| parse_core_range(s)).transpose()?;
            return maxwell::cli::helper::run_helper(action, cores, *ddrbw_set);
        }
        None => {}
    }

    let (core_first, core_last) = resolve_cores(&cli.core)?;
    let thread_count = core_last - core_first + 1;
    let priorities = parse_weights(&cli.weight, thread_count)?;

    // TARGET RESOLUTION: EXPLICIT > SELF-TEST > DMI FRACTION
    let (bw_mode, ddr_bw_target) = if let Some(mb_s) = cli.ddrbw_set {
        (BwMode::Set(mb_s), mb_s)
    } else if cli.ddrbw_test {
        (BwMode::SelfTest, 0)
    } else {
        let max = topology::dmi_max_bandwidth_mb_s().ok_or(ConfigError::NoBandwidthTarget)?;
        let target = (max as f64 * cli.ddrbw_auto) as u32;
        if target == 0 {
            return Err(ConfigError::NoBandwidthTarget.into());
        }
        (BwMode::AutoFraction, target)
    };

    let seed = cli.seed.unwrap_or_else(rand::random::<u64>);

    let cfg = Config {
        core_first,
        core_last,
        cores_per_module: cli.cores_per_module,
        interval_s: clamp_interval(cli.intervall),
        algorithm: Algorithm::from_flag(cli.alg)?,
        aggressiveness: clamp_aggressiveness(cli.aggr),
        bw_mode,
        ddr_bw_target,
        priorities,
        epsilon: cli.epsilon,
        gamma: cli.gamma,
        exploration: cli.exploration,
        arm_table: cli.arms,
        reward: RewardKind::from_flag(cli.reward)?,
        dynamic_sd: DynamicSd::from_flag(cli.dynamic_sd)?,
        sd_window: cli.window,
        seed,
        dry_run: cli.dry_run,
        dump_log: cli.dump_log,
    };
    cfg.validate()?;

    println!("MAXWELL v1.0.0");
    println!(
        "CORES:           {}-{} = {} threads",
        core_first, core_last, thread_count
    );
    println!("ALGORITHM:       {}", cfg.algorithm.label());
    println!("TICK:            {}s", cfg.interval_s);
    match cfg.bw_mode {
        BwMode::Set(_) => println!("DDR BW TARGET:   {} MB/s (set)", cfg.ddr_bw_target),
        BwMode::AutoFraction => println!(
            "DDR BW TARGET:   {} MB/s (dmi x {:.2})",
            cfg.ddr_bw_target, cli.ddrbw_auto
        ),
        BwMode::SelfTest => println!("DDR BW TARGET:   self-test before first tick"),
    }
    if cfg.algorithm == Algorithm::Mab {
        println!(
            "BANDIT:          eps={} gamma={} c={} arms={} seed={}",
            cfg.epsilon, cfg.gamma, cfg.exploration, cfg.arm_table, cfg.seed
        );
    }
    if cfg.dry_run {
        println!("DRY RUN:         shadow registers, null probe");
    }
    println!();

    let backend: Arc<dyn MsrBackend> = if cfg.dry_run {
        Arc::new(ShadowMsr::new())
    } else {
        Arc::new(DevMsr)
    };

    // A DRY RUN SELECTS THE NULL PROBE BY ITSELF
    let engine = Engine::new(cfg, backend);

    let shutdown = engine.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::Relaxed);
    })?;

    println!("MAXWELL IS ACTIVE (CTRL+C TO EXIT)");
    engine.run()?;

    info!("clean shutdown");
    println!("MAXWELL OUT.");
    Ok(())
}
