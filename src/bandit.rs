// MAXWELL CONTEXTUAL BANDIT (MAB)
// EPSILON-GREEDY / UCB SELECTION OVER AN IMMUTABLE ARM TABLE OF
// PREFETCHER MSR VALUES, EXPONENTIALLY-WEIGHTED REWARD ESTIMATES, AND
// AN OPTIONAL SLIDING-WINDOW IPC STANDARD DEVIATION AS CONTEXT.
//
// THE SAME ARM INDEX APPLIES TO EVERY MODULE WITHIN A TICK. ALL STATE
// IS OWNED BY THE MASTER AND MUTATED ONLY INSIDE THE BARRIER-HELD
// WINDOW -- ONE CREDIT AND ONE SELECTION PER TICK, NOTHING ELSE.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DynamicSd, RewardKind};

// STEP MODE ONLY PERMITS AN ARM CHANGE WHEN SIGMA MOVED BY MORE THAN
// THIS BETWEEN CONSECUTIVE TICKS
pub const SD_STEP_THRESHOLD: f64 = 0.05;

// WEIGHT OF THE SIGMA PENALTY IN THE SD_PENALIZED REWARD
pub const SD_PENALTY_WEIGHT: f64 = 1.0;

// ARM TABLE 0: THE FULL MISC_FEATURE_CONTROL DISABLE-MASK SPACE,
// ORDERED MOST CONSERVATIVE (ALL FOUR PREFETCHERS OFF) TO MOST
// AGGRESSIVE (ALL ON). INDEX 0 IS THE SAFE RESTORE VALUE.
pub const ARM_TABLE_FULL: [u64; 16] = [
    0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A, 0x09, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01,
    0x00,
];

// ARM TABLE 1: THE HEUR LADDER AS A COARSE 4-ARM SET
pub const ARM_TABLE_COARSE: [u64; 4] = [0x0F, 0x0B, 0x03, 0x00];

pub fn arm_table(id: usize) -> &'static [u64] {
    match id {
        1 => &ARM_TABLE_COARSE,
        _ => &ARM_TABLE_FULL,
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Arm {
    pub msr_value: u64,
    pub q: f64,
    pub pulls: u64,
    pub last_selected_tick: u64,
}

// FIXED-LENGTH RING FOR THE IPC / SIGMA CONTEXT WINDOWS.
// ALLOCATED ONCE AT INIT, NEVER GROWS.
struct Ring {
    buf: Vec<f64>,
    head: usize,
    len: usize,
}

impl Ring {
    fn new(cap: usize) -> Self {
        Self {
            buf: vec![0.0; cap],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, v: f64) {
        self.buf[self.head] = v;
        self.head = (self.head + 1) % self.buf.len();
        if self.len < self.buf.len() {
            self.len += 1;
        }
    }

    fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.buf.len() - 1) % self.buf.len();
        Some(self.buf[idx])
    }

    // SAMPLE STANDARD DEVIATION OVER THE OCCUPIED PORTION
    fn sample_sd(&self) -> f64 {
        if self.len < 2 {
            return 0.0;
        }
        let vals = &self.buf[..self.len];
        let mean = vals.iter().sum::<f64>() / self.len as f64;
        let var = vals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
            / (self.len - 1) as f64;
        var.sqrt()
    }
}

pub struct MabParams {
    pub epsilon: f64,
    pub gamma: f64,
    pub exploration: f64,
    pub reward: RewardKind,
    pub dynamic_sd: DynamicSd,
    pub sd_window: usize,
    pub seed: u64,
}

pub struct MabState {
    arms: Vec<Arm>,
    arm: usize,
    tick: u64,
    epsilon: f64,
    gamma: f64,
    c: f64,
    reward: RewardKind,
    dynamic_sd: DynamicSd,
    ipc_ring: Ring,
    sd_ring: Ring,
    rng: StdRng,
    last_reward: f64,
}

impl MabState {
    pub fn new(table: &[u64], params: MabParams) -> Self {
        Self {
            arms: table
                .iter()
                .map(|&msr_value| Arm {
                    msr_value,
                    q: 0.0,
                    pulls: 0,
                    last_selected_tick: 0,
                })
                .collect(),
            arm: 0,
            tick: 0,
            epsilon: params.epsilon,
            gamma: params.gamma,
            c: params.exploration,
            reward: params.reward,
            dynamic_sd: params.dynamic_sd,
            ipc_ring: Ring::new(params.sd_window),
            sd_ring: Ring::new(params.sd_window),
            rng: StdRng::seed_from_u64(params.seed),
            last_reward: 0.0,
        }
    }

    pub fn arm(&self) -> usize {
        self.arm
    }

    pub fn arms(&self) -> &[Arm] {
        &self.arms
    }

    pub fn msr_value(&self) -> u64 {
        self.arms[self.arm].msr_value
    }

    // RESTORE VALUE ON SHUTDOWN
    pub fn safe_value(&self) -> u64 {
        self.arms[0].msr_value
    }

    // SHAPED REWARD OBSERVED ON THE MOST RECENT TICK (TELEMETRY)
    pub fn last_reward(&self) -> f64 {
        self.last_reward
    }

    // ONE TICK: OBSERVE -> CONTEXT -> REWARD -> CREDIT -> SELECT.
    // RETURNS THE ARM FOR THE COMING TICK. THE REWARD OBSERVED NOW IS
    // THE EFFECT OF THE PREVIOUSLY SELECTED ARM, SO THE CREDIT GOES TO
    // THE PREVIOUS SELECTION.
    pub fn step(&mut self, ipc_mean: f64, bw_mb_s: u32, target_mb_s: u32) -> usize {
        self.tick += 1;
        let t = self.tick;

        // CONTEXT: SLIDING SIGMA OVER THE FLEET IPC
        let mut sigma = 0.0;
        let mut sigma_prev = 0.0;
        let mut window_full = false;
        if self.dynamic_sd != DynamicSd::Off {
            self.ipc_ring.push(ipc_mean);
            if self.ipc_ring.is_full() {
                window_full = true;
                sigma = self.ipc_ring.sample_sd();
                sigma_prev = self.sd_ring.last().unwrap_or(0.0);
                self.sd_ring.push(sigma);
            }
        }

        // REWARD SHAPING
        let mut r = match self.reward {
            RewardKind::Ipc => ipc_mean,
            RewardKind::IpcOverBandwidth => ipc_mean / bw_mb_s.max(1) as f64,
            RewardKind::SdPenalized => {
                if window_full {
                    ipc_mean - SD_PENALTY_WEIGHT * sigma
                } else {
                    ipc_mean
                }
            }
        };
        // BANDWIDTH OVERSHOOT PENALTY, NEVER NEGATIVE
        if bw_mb_s > target_mb_s {
            r *= target_mb_s as f64 / bw_mb_s as f64;
        }
        r = r.max(0.0);
        self.last_reward = r;

        // CREDIT THE PREVIOUS ARM. THE FIRST CREDIT OF AN ARM SEEDS THE
        // ESTIMATE WITH THE OBSERVATION ITSELF; AFTER THAT THE
        // EXPONENTIAL FORM APPLIES. AT MOST ONE CREDIT PER TICK.
        if t > 1 {
            let prev = &mut self.arms[self.arm];
            prev.q = if prev.pulls == 0 {
                r
            } else {
                self.gamma * prev.q + (1.0 - self.gamma) * r
            };
            prev.pulls += 1;
        }

        // SELECT THE NEXT ARM
        let mut next = if t == 1 {
            0
        } else if self.rng.gen::<f64>() < self.epsilon {
            self.rng.gen_range(0..self.arms.len())
        } else {
            self.ucb_argmax(t)
        };

        // STEP GATE: ONLY PERMIT A CHANGE WHEN SIGMA ACTUALLY MOVED
        if self.dynamic_sd == DynamicSd::Step
            && t > 1
            && (sigma - sigma_prev).abs() <= SD_STEP_THRESHOLD
        {
            next = self.arm;
        }

        // UNKNOWN BANDWIDTH: NEVER RAISE AGGRESSIVENESS ON A BLIND TICK
        if bw_mb_s == 0 && t > 1 {
            next = self.arm;
        }

        self.arm = next;
        self.arms[next].last_selected_tick = t;
        next
    }

    // UCB SCORE: Q + C * SQRT(LN T / PULLS). UNPULLED ARMS SCORE
    // INFINITE SO EVERY ARM IS EXPLORED BEFORE EXPLOITATION BEGINS.
    // TIES BREAK TOWARD THE LOWER INDEX.
    fn ucb_argmax(&self, t: u64) -> usize {
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            let bonus = if t == 0 || arm.pulls == 0 {
                f64::INFINITY
            } else {
                self.c * ((t as f64).ln() / arm.pulls as f64).sqrt()
            };
            let score = arm.q + bonus;
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        best
    }
}

// PRIORITY-WEIGHTED FLEET IPC: SUM(P_C * IPC_C) / SUM(P_C).
// AN ALL-ZERO WEIGHT VECTOR DEGENERATES TO THE PLAIN MEAN.
pub fn priority_weighted_ipc(ipc: &[f64], priority: &[u32]) -> f64 {
    if ipc.is_empty() {
        return 0.0;
    }
    let weight_sum: u64 = priority.iter().map(|&p| p as u64).sum();
    if weight_sum == 0 {
        return ipc.iter().sum::<f64>() / ipc.len() as f64;
    }
    ipc.iter()
        .zip(priority)
        .map(|(&v, &p)| v * p as f64)
        .sum::<f64>()
        / weight_sum as f64
}
