// MAXWELL CONFIGURATION SURFACE
// TYPED OPTIONS BUILT ONCE AT STARTUP, HANDED TO THE ENGINE BY VALUE.
// CLAMP BOUNDS AND DEFAULTS MATCH THE CLI DOCUMENTATION IN main.rs.

use crate::error::ConfigError;

pub const MIN_PRIORITY: u32 = 0;
pub const MAX_PRIORITY: u32 = 99;
pub const DEFAULT_PRIORITY: u32 = 50;

pub const MIN_INTERVAL_S: f64 = 0.0001;
pub const MAX_INTERVAL_S: f64 = 60.0;

pub const MIN_AGGR: f64 = 0.1;
pub const MAX_AGGR: f64 = 5.0;

// DEFAULT FRACTION OF THE DMI-REPORTED THEORETICAL MAX THAT IS
// TYPICALLY ACHIEVABLE
pub const DEFAULT_BW_UTILIZATION: f64 = 0.70;

pub const DEFAULT_EPSILON: f64 = 0.1;
pub const DEFAULT_GAMMA: f64 = 0.959;
pub const DEFAULT_EXPLORATION: f64 = 0.0006;
pub const DEFAULT_SD_WINDOW: usize = 30;

pub const DEFAULT_CORES_PER_MODULE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Algorithm {
    // BANDWIDTH-GATED LADDER WALK
    Heur = 0,
    // LADDER WALK WITH PER-MODULE PRIORITY SCALING
    HeurPrio = 1,
    // EPSILON-GREEDY / UCB BANDIT OVER AN ARM TABLE
    Mab = 2,
}

impl Algorithm {
    pub fn from_flag(v: u32) -> Result<Self, ConfigError> {
        match v {
            0 => Ok(Self::Heur),
            1 => Ok(Self::HeurPrio),
            2 => Ok(Self::Mab),
            _ => Err(ConfigError::BadFlag {
                flag: "--alg",
                value: v.to_string(),
            }),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Heur => "HEUR",
            Self::HeurPrio => "HEUR_PRIO",
            Self::Mab => "MAB",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RewardKind {
    Ipc = 0,
    IpcOverBandwidth = 1,
    SdPenalized = 2,
}

impl RewardKind {
    pub fn from_flag(v: u32) -> Result<Self, ConfigError> {
        match v {
            0 => Ok(Self::Ipc),
            1 => Ok(Self::IpcOverBandwidth),
            2 => Ok(Self::SdPenalized),
            _ => Err(ConfigError::BadFlag {
                flag: "--reward",
                value: v.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DynamicSd {
    Off = 0,
    On = 1,
    // ONLY PERMIT ARM CHANGES WHEN SIGMA MOVED MORE THAN THE STEP THRESHOLD
    Step = 2,
}

impl DynamicSd {
    pub fn from_flag(v: u32) -> Result<Self, ConfigError> {
        match v {
            0 => Ok(Self::Off),
            1 => Ok(Self::On),
            2 => Ok(Self::Step),
            _ => Err(ConfigError::BadFlag {
                flag: "--dynamic-sd",
                value: v.to_string(),
            }),
        }
    }
}

// HOW THE BANDWIDTH TARGET IS DETERMINED
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BwMode {
    // --ddrbw-set: EXPLICIT MB/S
    Set(u32),
    // --ddrbw-auto: FRACTION OF DMI THEORETICAL MAX, RESOLVED AT STARTUP
    AutoFraction,
    // --ddrbw-test: ONE-SHOT STREAMING SELF-TEST BEFORE THE MAIN LOOP
    SelfTest,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub core_first: usize,
    pub core_last: usize,
    pub cores_per_module: usize,
    pub interval_s: f64,
    pub algorithm: Algorithm,
    pub aggressiveness: f64,
    pub bw_mode: BwMode,
    // RESOLVED TARGET IN MB/S; 0 UNTIL SELF-TEST COMPLETES IN SelfTest MODE
    pub ddr_bw_target: u32,
    pub priorities: Vec<u32>,
    pub epsilon: f64,
    pub gamma: f64,
    pub exploration: f64,
    pub arm_table: usize,
    pub reward: RewardKind,
    pub dynamic_sd: DynamicSd,
    pub sd_window: usize,
    pub seed: u64,
    pub dry_run: bool,
    pub dump_log: bool,
}

impl Config {
    pub fn thread_count(&self) -> usize {
        self.core_last - self.core_first + 1
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_last < self.core_first {
            return Err(ConfigError::EmptyCoreSet {
                first: self.core_first,
                last: self.core_last,
            });
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(ConfigError::BadFlag {
                flag: "--epsilon",
                value: self.epsilon.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ConfigError::BadFlag {
                flag: "--gamma",
                value: self.gamma.to_string(),
            });
        }
        if self.exploration < 0.0 {
            return Err(ConfigError::BadFlag {
                flag: "--exploration",
                value: self.exploration.to_string(),
            });
        }
        if self.sd_window < 2 {
            return Err(ConfigError::BadFlag {
                flag: "--window",
                value: self.sd_window.to_string(),
            });
        }
        if self.cores_per_module == 0 {
            return Err(ConfigError::BadFlag {
                flag: "--cores-per-module",
                value: "0".to_string(),
            });
        }
        if matches!(self.bw_mode, BwMode::Set(0)) {
            return Err(ConfigError::NoBandwidthTarget);
        }
        Ok(())
    }
}

pub fn clamp_interval(seconds: f64) -> f64 {
    seconds.clamp(MIN_INTERVAL_S, MAX_INTERVAL_S)
}

pub fn clamp_aggressiveness(aggr: f64) -> f64 {
    aggr.clamp(MIN_AGGR, MAX_AGGR)
}

// PARSE A COMMA-SEPARATED PRIORITY LIST. MISSING TAIL ENTRIES DEFAULT TO
// 50, SURPLUS ENTRIES ARE REJECTED. VALUES OUTSIDE 0-99 ARE REJECTED.
pub fn parse_weights(arg: &str, thread_count: usize) -> Result<Vec<u32>, ConfigError> {
    let mut out = Vec::with_capacity(thread_count);

    if !arg.is_empty() {
        for token in arg.split(',') {
            if out.len() == thread_count {
                return Err(ConfigError::BadFlag {
                    flag: "--weight",
                    value: format!("{} values for {} cores", out.len() + 1, thread_count),
                });
            }
            let v: i64 = token.trim().parse().map_err(|_| ConfigError::BadFlag {
                flag: "--weight",
                value: token.to_string(),
            })?;
            if v < MIN_PRIORITY as i64 || v > MAX_PRIORITY as i64 {
                return Err(ConfigError::PriorityRange(v));
            }
            out.push(v as u32);
        }
    }

    while out.len() < thread_count {
        out.push(DEFAULT_PRIORITY);
    }

    Ok(out)
}

// PARSE "A-B" OR "A" CORE RANGE SYNTAX
pub fn parse_core_range(arg: &str) -> Result<(usize, usize), ConfigError> {
    let bad = || ConfigError::BadFlag {
        flag: "--core",
        value: arg.to_string(),
    };

    match arg.split_once('-') {
        Some((a, b)) => {
            let first = a.trim().parse().map_err(|_| bad())?;
            let last = b.trim().parse().map_err(|_| bad())?;
            if last < first {
                return Err(ConfigError::EmptyCoreSet { first, last });
            }
            Ok((first, last))
        }
        None => {
            let core = arg.trim().parse().map_err(|_| bad())?;
            Ok((core, core))
        }
    }
}
