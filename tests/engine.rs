// MAXWELL ENGINE TESTS
// FULL THREADED RUNS AGAINST THE SHADOW REGISTER FILE AND A SCRIPTED
// BANDWIDTH PROBE. EXERCISES PINNING, THE TICK BARRIER, DECISION
// FAN-OUT, MSR WRITE DISCIPLINE, AND THE SHUTDOWN RESTORE.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use maxwell::bandwidth::BandwidthProbe;
use maxwell::config::{Algorithm, BwMode, Config, DynamicSd, RewardKind};
use maxwell::msr::ShadowMsr;
use maxwell::pmu::PREFETCH_CTRL_MSR;
use maxwell::runtime::Engine;

// DRAINS A FIXED SCRIPT, THEN TRIPS THE SHUTDOWN FLAG. EVERY TICK
// AFTER THE SCRIPT REPORTS UNKNOWN BANDWIDTH, WHICH BOTH CONTROLLERS
// TREAT AS A HOLD -- THE WRITE JOURNAL STAYS DETERMINISTIC.
struct ScriptedProbe {
    script: VecDeque<u32>,
    shutdown: Arc<AtomicBool>,
}

impl ScriptedProbe {
    fn new(values: &[u32], shutdown: Arc<AtomicBool>) -> Self {
        Self {
            script: values.iter().copied().collect(),
            shutdown,
        }
    }
}

impl BandwidthProbe for ScriptedProbe {
    fn sample_mb_s(&mut self) -> u32 {
        match self.script.pop_front() {
            Some(v) => v,
            None => {
                self.shutdown.store(true, Ordering::Relaxed);
                0
            }
        }
    }

    fn label(&self) -> &'static str {
        "SCRIPTED"
    }
}

fn base_config(first: usize, last: usize, alg: Algorithm) -> Config {
    Config {
        core_first: first,
        core_last: last,
        cores_per_module: 2,
        interval_s: 0.002,
        algorithm: alg,
        aggressiveness: 1.0,
        bw_mode: BwMode::Set(10000),
        ddr_bw_target: 10000,
        priorities: vec![50; last - first + 1],
        epsilon: 0.0,
        gamma: 0.959,
        exploration: 0.0006,
        arm_table: 1,
        reward: RewardKind::Ipc,
        dynamic_sd: DynamicSd::Off,
        sd_window: 30,
        seed: 42,
        dry_run: false,
        dump_log: false,
    }
}

// === HEUR END TO END ===

#[test]
fn heur_writes_follow_the_bandwidth_script() {
    let shadow = ShadowMsr::new();
    let cfg = base_config(0, 1, Algorithm::Heur);
    let engine = Engine::new(cfg, Arc::new(shadow.clone()));
    let shutdown = engine.shutdown_flag();

    // TARGET 10000, START LEVEL 0: 9600 RAISES, 10200 CUTS, 10150
    // HOLDS, 9300 RAISES
    let probe = ScriptedProbe::new(&[9600, 10200, 10150, 9300], shutdown);
    let engine = engine.with_probe(Box::new(probe));

    engine.run().unwrap();

    // CORE 0 IS THE MODULE PRIMARY: STARTUP SAFE WRITE, THREE STAGED
    // DECISIONS (THE HOLD TICK COSTS NOTHING), RESTORE ON EXIT
    let writes = shadow.writes_to(0, PREFETCH_CTRL_MSR);
    assert_eq!(writes, vec![0x0F, 0x0B, 0x0F, 0x0B, 0x0F]);

    // CORE 1 IS NOT A PRIMARY AND NEVER TOUCHES THE PREFETCHER MSR
    assert!(shadow.writes_to(1, PREFETCH_CTRL_MSR).is_empty());
}

// === MAB END TO END, SINGLE CORE ===

#[test]
fn single_core_mab_selects_and_restores() {
    // SINGLE PARTICIPANT: THE BARRIER DEGENERATES TO A NO-OP AND THE
    // BANDIT STILL WALKS ITS WARM-UP SWEEP
    let shadow = ShadowMsr::new();
    let cfg = base_config(0, 0, Algorithm::Mab);
    let engine = Engine::new(cfg, Arc::new(shadow.clone()));
    let shutdown = engine.shutdown_flag();

    let probe = ScriptedProbe::new(&[5000, 5000, 5000, 5000, 5000], shutdown);
    let engine = engine.with_probe(Box::new(probe));

    engine.run().unwrap();

    // COARSE TABLE, EPS=0: TICK 1 HOLDS ARM 0, TICKS 2-4 SWEEP THE
    // UNPULLED ARMS (INFINITE UCB BONUS), TICK 5 RETURNS TO ARM 0
    // (ALL REWARDS ZERO, TIE TO THE LOWEST INDEX), RESTORE ON EXIT
    let writes = shadow.writes_to(0, PREFETCH_CTRL_MSR);
    assert_eq!(writes, vec![0x0F, 0x0B, 0x03, 0x00, 0x0F, 0x0F]);
}

// === SHUTDOWN RESTORE WITHIN A TICK ===

#[test]
fn shutdown_restores_conservative_value_quickly() {
    let shadow = ShadowMsr::new();
    let mut cfg = base_config(0, 1, Algorithm::Mab);
    cfg.interval_s = 0.01;
    let engine = Engine::new(cfg, Arc::new(shadow.clone()));
    let shutdown = engine.shutdown_flag();

    // ENDLESS SCRIPT -- THE TEST, NOT THE PROBE, STOPS THE RUN
    let probe = ScriptedProbe::new(&[8000; 10_000], Arc::new(AtomicBool::new(false)));
    let engine = engine.with_probe(Box::new(probe));

    let runner = std::thread::spawn(move || engine.run().unwrap());
    std::thread::sleep(Duration::from_millis(50));

    let asked = Instant::now();
    shutdown.store(true, Ordering::Relaxed);
    runner.join().unwrap();
    let took = asked.elapsed();

    // EXIT OBSERVED WITHIN ONE TICK PLUS SCHEDULING SLACK
    assert!(took < Duration::from_millis(500), "join took {:?}", took);

    // THE LAST PREFETCHER WRITE IS THE SAFE VALUE
    let writes = shadow.writes_to(0, PREFETCH_CTRL_MSR);
    assert_eq!(*writes.last().unwrap(), 0x0F);
    assert_eq!(shadow.value(0, PREFETCH_CTRL_MSR), 0x0F);
}

// === COUNTER PROGRAMMING HAPPENS ON EVERY CORE ===

#[test]
fn samplers_program_pmu_before_first_tick() {
    let shadow = ShadowMsr::new();
    let cfg = base_config(0, 1, Algorithm::Heur);
    let engine = Engine::new(cfg, Arc::new(shadow.clone()));
    let shutdown = engine.shutdown_flag();
    let probe = ScriptedProbe::new(&[9000], shutdown);

    engine.with_probe(Box::new(probe)).run().unwrap();

    for core in 0..2 {
        // SEVEN EVENT SELECTS PLUS THE FIXED-COUNTER CONTROL
        assert_eq!(
            shadow.value(core, 0x186),
            maxwell::pmu::PMU_EVENTS[0],
            "evtsel0 on core {}",
            core
        );
        assert_eq!(
            shadow.value(core, 0x18C),
            maxwell::pmu::PMU_EVENTS[6],
            "evtsel6 on core {}",
            core
        );
        assert_eq!(shadow.value(core, 0x38D), 0x333, "fixed ctrl on core {}", core);
        let global = shadow.value(core, 0x38F);
        assert_eq!(global & 0x7F, 0x7F, "pmc enable on core {}", core);
        assert_eq!(global >> 32 & 0b11, 0b11, "fixed enable on core {}", core);
    }
}
