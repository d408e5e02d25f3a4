// MAXWELL LADDER HEURISTIC (HEUR)
// BANDWIDTH-GATED WALK OVER A MONOTONE LADDER OF PREFETCHER SETTINGS.
// PURE DECISION LOGIC -- NO DEVICE ACCESS, FULLY TESTABLE OFFLINE.
//
// LEVEL 0 = MOST CONSERVATIVE (ALL PREFETCHERS OFF), LEVEL L-1 = MOST
// AGGRESSIVE. EACH STEP IS EXPECTED TO MOVE BANDWIDTH BY ROUGHLY ONE
// QUANTUM = TARGET/(L-1), SO THE ACT/HOLD MARGINS ARE FRACTIONS OF
// THAT QUANTUM, NOT OF THE WHOLE TARGET.

// DEFAULT LADDER OVER MISC_FEATURE_CONTROL (0x1A4) DISABLE BITS
pub const LADDER: [u64; 4] = [0x0F, 0x0B, 0x03, 0x00];

// RAISE WHEN HEADROOM EXCEEDS 10% OF A QUANTUM, LOWER WHEN THE DEFICIT
// EXCEEDS 5%. ASYMMETRY BIASES TOWARD BACKING OFF.
pub const MARGIN_UP_PCT: u64 = 10;
pub const MARGIN_DOWN_PCT: u64 = 5;

// STEP SIZE SCALES WITH THE RETUNE AGGRESSIVENESS KNOB (0.1 - 5.0).
// ALWAYS AT LEAST ONE LEVEL ONCE A MOVE IS INDICATED.
pub fn step_size(aggr: f64) -> usize {
    (aggr.round() as usize).max(1)
}

fn margins(target_mb_s: u32, levels: usize) -> (f64, f64) {
    if levels < 2 {
        return (0.0, 0.0);
    }
    let quantum = target_mb_s as f64 / (levels - 1) as f64;
    (
        quantum * MARGIN_UP_PCT as f64 / 100.0,
        quantum * MARGIN_DOWN_PCT as f64 / 100.0,
    )
}

// ONE DECISION. bw == 0 MEANS THE PROBE COULD NOT MEASURE -- HOLD.
// TIES PREFER THE CONSERVATIVE DIRECTION: A RAISE NEEDS STRICTLY MORE
// HEADROOM THAN THE MARGIN, A CUT TRIGGERS ON THE MARGIN ITSELF.
pub fn decide(level: usize, levels: usize, bw_mb_s: u32, target_mb_s: u32, step: usize) -> usize {
    if bw_mb_s == 0 {
        return level;
    }

    let (margin_up, margin_down) = margins(target_mb_s, levels);
    let headroom = target_mb_s as f64 - bw_mb_s as f64;

    if headroom > margin_up {
        (level + step).min(levels - 1)
    } else if headroom <= -margin_down {
        level.saturating_sub(step)
    } else {
        level
    }
}

// PER-MODULE LADDER STATE. THE PRIO VARIANT SCALES UP-STEPS BY THE
// MODULE'S SUMMED CORE PRIORITY RELATIVE TO THE FLEET MEAN AND
// DOWN-STEPS BY THE INVERSE: IMPORTANT MODULES GAIN AGGRESSIVENESS
// FASTER AND SURRENDER IT SLOWER.
pub struct HeurState {
    ladder: &'static [u64],
    levels: Vec<usize>,
    aggr: f64,
    prio_scaled: bool,
}

impl HeurState {
    pub fn new(modules: usize, initial_level: usize, aggr: f64, prio_scaled: bool) -> Self {
        Self::with_ladder(&LADDER, modules, initial_level, aggr, prio_scaled)
    }

    pub fn with_ladder(
        ladder: &'static [u64],
        modules: usize,
        initial_level: usize,
        aggr: f64,
        prio_scaled: bool,
    ) -> Self {
        let initial = initial_level.min(ladder.len() - 1);
        Self {
            ladder,
            levels: vec![initial; modules],
            aggr,
            prio_scaled,
        }
    }

    pub fn tick(&mut self, bw_mb_s: u32, target_mb_s: u32, module_priority: &[u32]) {
        let base = step_size(self.aggr);
        let mean = if module_priority.is_empty() {
            0.0
        } else {
            module_priority.iter().map(|&p| p as f64).sum::<f64>() / module_priority.len() as f64
        };

        for (m, level) in self.levels.iter_mut().enumerate() {
            let (up, down) = if self.prio_scaled && mean > 0.0 {
                let factor = module_priority.get(m).copied().unwrap_or(0) as f64 / mean;
                (
                    ((base as f64 * factor).round() as usize).max(1),
                    ((base as f64 / factor.max(f64::MIN_POSITIVE)).round() as usize).max(1),
                )
            } else {
                (base, base)
            };

            // DIRECTION DECIDES WHICH SCALED STEP APPLIES
            let raised = decide(*level, self.ladder.len(), bw_mb_s, target_mb_s, up);
            *level = if raised > *level {
                raised
            } else {
                decide(*level, self.ladder.len(), bw_mb_s, target_mb_s, down)
            };
        }
    }

    pub fn level(&self, module: usize) -> usize {
        self.levels[module]
    }

    pub fn msr_value(&self, module: usize) -> u64 {
        self.ladder[self.levels[module]]
    }

    // RESTORE VALUE ON SHUTDOWN: THE CONSERVATIVE END OF THE LADDER
    pub fn safe_value(&self) -> u64 {
        self.ladder[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_size_scales_with_aggr() {
        assert_eq!(step_size(1.0), 1);
        assert_eq!(step_size(0.1), 1);
        assert_eq!(step_size(2.0), 2);
        assert_eq!(step_size(5.0), 5);
    }

    #[test]
    fn unknown_bandwidth_holds() {
        assert_eq!(decide(2, 4, 0, 10000, 1), 2);
    }

    #[test]
    fn zero_target_never_advances() {
        // ANY MEASURED TRAFFIC IS OVER A ZERO TARGET
        assert_eq!(decide(2, 4, 100, 0, 1), 1);
        assert_eq!(decide(0, 4, 100, 0, 1), 0);
    }

    #[test]
    fn clamps_at_ladder_ends() {
        assert_eq!(decide(3, 4, 1000, 10000, 2), 3);
        assert_eq!(decide(0, 4, 20000, 10000, 2), 0);
    }

    #[test]
    fn margin_boundary_prefers_conservative() {
        // QUANTUM = 10000/3, MARGIN_UP = 333.33..: HEADROOM EXACTLY AT
        // THE RAISE MARGIN MUST HOLD, JUST UNDER THE CUT MARGIN TOO
        let (up, down) = margins(9000, 4); // QUANTUM 3000 -> 300 / 150
        assert_eq!(up, 300.0);
        assert_eq!(down, 150.0);
        assert_eq!(decide(1, 4, 9000 - 300, 9000, 1), 1); // == MARGIN: HOLD
        assert_eq!(decide(1, 4, 9000 - 301, 9000, 1), 2); // PAST: RAISE
        assert_eq!(decide(1, 4, 9000 + 150, 9000, 1), 0); // == MARGIN: CUT
        assert_eq!(decide(1, 4, 9000 + 149, 9000, 1), 1); // UNDER: HOLD
    }

    #[test]
    fn prio_scaling_biases_steps() {
        // TWO MODULES, PRIORITY SUMS 200 VS 100 (MEAN 150).
        // BIG HEADROOM: HIGH-PRIO MODULE RAISES FASTER.
        let mut st = HeurState::new(2, 0, 1.0, true);
        st.tick(1000, 10000, &[200, 100]);
        assert_eq!(st.level(0), 1); // round(1 * 200/150) = 1
        assert_eq!(st.level(1), 1); // round(1 * 100/150) = 1, FLOOR 1

        let mut st = HeurState::new(2, 0, 2.0, true);
        st.tick(1000, 10000, &[200, 100]);
        assert_eq!(st.level(0), 3); // round(2 * 4/3) = 3
        assert_eq!(st.level(1), 1); // round(2 * 2/3) = 1
    }
}
