// MAXWELL RUNTIME
// ONE PINNED SAMPLER THREAD PER MONITORED CORE, ZERO MUTEXES ON THE
// TICK PATH. EVERY CROSS-THREAD CELL IS AN ATOMIC WITH A SINGLE WRITER:
//   SAMPLE CELLS   -- WRITTEN BY THE OWNING SAMPLER, READ BY THE MASTER
//                     ONLY INSIDE THE BARRIER-HELD WINDOW
//   DECISION CELLS -- WRITTEN BY THE MASTER INSIDE THE WINDOW, READ BY
//                     THE MODULE PRIMARY AFTER RELEASE
//
// PER-TICK FLOW: SLEEP -> READ COUNTERS -> PUBLISH -> BARRIER ->
// (MASTER: PROBE + CONTROLLER + DECISIONS) -> RELEASE -> PRIMARIES
// APPLY MSRS -> NEXT TICK.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::bandit::{priority_weighted_ipc, MabParams, MabState};
use crate::bandwidth::{self, BandwidthProbe, NullProbe};
use crate::barrier::TickBarrier;
use crate::config::{Algorithm, BwMode, Config};
use crate::event::TickLog;
use crate::heur::HeurState;
use crate::msr::{MsrAccess, MsrBackend};
use crate::pmu::{self, CounterDelta, CounterSnapshot, PMU_COUNTERS, PREFETCH_CTRL_MSR};
use crate::topology::module_of;

pub struct CoreSlot {
    pub core_id: usize,
    pub module_id: usize,
    pub priority: u32,
    pub is_primary: bool,

    retired: AtomicU64,
    cycles: AtomicU64,
    pmu: [AtomicU64; PMU_COUNTERS],
    fault: AtomicBool,

    msr_dirty: AtomicBool,
    msr_value: AtomicU64,
}

#[derive(Clone, Copy, Default)]
pub struct CoreSample {
    pub retired: u64,
    pub cycles: u64,
    pub all_loads: u64,
    pub dram_loads: u64,
    pub fault: bool,
}

impl CoreSample {
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.retired as f64 / self.cycles as f64
        }
    }
}

impl CoreSlot {
    fn new(core_id: usize, module_id: usize, priority: u32, is_primary: bool) -> Self {
        Self {
            core_id,
            module_id,
            priority,
            is_primary,
            retired: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            pmu: std::array::from_fn(|_| AtomicU64::new(0)),
            fault: AtomicBool::new(false),
            msr_dirty: AtomicBool::new(false),
            msr_value: AtomicU64::new(0),
        }
    }

    // SAMPLER SIDE. THE BARRIER ARRIVAL PROVIDES THE RELEASE FENCE;
    // RELAXED STORES ARE SUFFICIENT HERE.
    fn publish(&self, d: &CounterDelta) {
        for (cell, v) in self.pmu.iter().zip(d.pmu.iter()) {
            cell.store(*v, Ordering::Relaxed);
        }
        self.retired.store(d.instructions, Ordering::Relaxed);
        self.cycles.store(d.cycles, Ordering::Relaxed);
        self.fault.store(d.suspect, Ordering::Relaxed);
    }

    // MASTER SIDE, ONLY INSIDE THE HELD WINDOW
    fn read(&self) -> CoreSample {
        let fault = self.fault.load(Ordering::Relaxed);
        if fault {
            return CoreSample {
                fault,
                ..Default::default()
            };
        }
        CoreSample {
            retired: self.retired.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            all_loads: self.pmu[0].load(Ordering::Relaxed),
            dram_loads: self.pmu[3].load(Ordering::Relaxed),
            fault,
        }
    }

    // MASTER SIDE: STAGE AN MSR WRITE FOR THE MODULE PRIMARY
    fn stage(&self, value: u64) {
        self.msr_value.store(value, Ordering::Relaxed);
        self.msr_dirty.store(true, Ordering::Relaxed);
    }

    // PRIMARY SIDE, AFTER RELEASE: CONSUME THE STAGED WRITE IF ANY
    fn take_staged(&self) -> Option<u64> {
        if self.msr_dirty.swap(false, Ordering::Relaxed) {
            Some(self.msr_value.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

// PER-MODULE RUNTIME STATE, OWNED BY THE MASTER. current_msr TRACKS
// WHAT THE MODULE'S PREFETCHER MSR HOLDS SO UNCHANGED DECISIONS COST
// ZERO WRITES.
struct ModuleRt {
    primary_slot: usize,
    current_msr: u64,
}

enum Controller {
    Heur(HeurState),
    Mab(MabState),
}

impl Controller {
    fn safe_value(&self) -> u64 {
        match self {
            Controller::Heur(st) => st.safe_value(),
            Controller::Mab(st) => st.safe_value(),
        }
    }
}

struct MasterCtx {
    probe: Box<dyn BandwidthProbe>,
    controller: Controller,
    modules: Vec<ModuleRt>,
    // SUMMED CORE PRIORITY PER MODULE, FIXED AT STARTUP
    module_priority: Vec<u32>,
    target_mb_s: u32,
    log: TickLog,
    dump_log: bool,
    tick: u64,
}

impl MasterCtx {
    // RUNS INSIDE THE BARRIER-HELD WINDOW. EVERY CoreSlot IS QUIESCENT.
    fn tick(&mut self, slots: &[CoreSlot]) {
        self.tick += 1;
        let bw = self.probe.sample_mb_s();

        let samples: Vec<CoreSample> = slots.iter().map(|s| s.read()).collect();
        let ipc: Vec<f64> = samples.iter().map(|s| s.ipc()).collect();
        let priority: Vec<u32> = slots.iter().map(|s| s.priority).collect();
        let ipc_mean = priority_weighted_ipc(&ipc, &priority);
        let faults = samples.iter().filter(|s| s.fault).count();
        let all_loads: u64 = samples.iter().map(|s| s.all_loads).sum();
        let dram_loads: u64 = samples.iter().map(|s| s.dram_loads).sum();

        let (setting, reward) = match &mut self.controller {
            Controller::Heur(st) => {
                st.tick(bw, self.target_mb_s, &self.module_priority);
                (st.level(0) as u32, 0.0)
            }
            Controller::Mab(st) => {
                let arm = st.step(ipc_mean, bw, self.target_mb_s);
                (arm as u32, st.last_reward())
            }
        };

        // FAN THE DECISION OUT TO MODULE PRIMARIES. ONLY CHANGED VALUES
        // ARE STAGED -- AN UNCHANGED TICK COSTS ZERO MSR WRITES.
        let mut writes = 0u32;
        for (m, module) in self.modules.iter_mut().enumerate() {
            let value = match &self.controller {
                Controller::Heur(st) => st.msr_value(m),
                Controller::Mab(st) => st.msr_value(),
            };
            if value != module.current_msr {
                slots[module.primary_slot].stage(value);
                module.current_msr = value;
                writes += 1;
            }
        }

        self.log.snapshot(bw, ipc_mean, reward, setting, writes);

        println!(
            "[{:>6}] bw: {:<7} target: {:<7} ipc: {:<6.3} loads: {:<10} dram: {:<9} setting: {:<3} writes: {:<2} faults: {}",
            self.tick, bw, self.target_mb_s, ipc_mean, all_loads, dram_loads, setting, writes,
            faults
        );
    }
}

struct SamplerCtx {
    core_id: usize,
    slot_idx: usize,
    interval: Duration,
    slots: Arc<Vec<CoreSlot>>,
    barrier: Arc<TickBarrier>,
    shutdown: Arc<AtomicBool>,
    backend: Arc<dyn MsrBackend>,
    // SAFE PREFETCHER VALUE WRITTEN AT STARTUP AND RESTORED ON EXIT
    safe_msr: u64,
    // SELF-TEST ACCUMULATOR, PRESENT ONLY IN --ddrbw-test MODE
    selftest: Option<Arc<AtomicU32>>,
    // SET BY A SAMPLER THAT DIES DURING INIT; TURNS INTO A NON-ZERO
    // EXIT AT THE ENGINE BOUNDARY
    init_failed: Arc<AtomicBool>,
    // THE MASTER ROLE: CONTROLLER, PROBE, MODULE STATE
    master: Option<MasterCtx>,
}

// FATAL SAMPLER INIT PATH: FLAG THE FAILURE AND TAKE EVERYONE DOWN
fn sampler_init_failed(ctx: &SamplerCtx) {
    ctx.init_failed.store(true, Ordering::Relaxed);
    ctx.shutdown.store(true, Ordering::Relaxed);
}

pub struct Engine {
    cfg: Config,
    backend: Arc<dyn MsrBackend>,
    shutdown: Arc<AtomicBool>,
    probe_override: Option<Box<dyn BandwidthProbe>>,
}

impl Engine {
    pub fn new(cfg: Config, backend: Arc<dyn MsrBackend>) -> Self {
        Self {
            cfg,
            backend,
            shutdown: Arc::new(AtomicBool::new(false)),
            probe_override: None,
        }
    }

    // HANDLE FOR THE SIGNAL HANDLER: SET TRUE AND EVERY THREAD WINDS
    // DOWN WITHIN ONE TICK
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    // INJECT A SPECIFIC PROBE (--dry-run, TESTS). WITHOUT THIS THE
    // ENGINE SELECTS MBM OR IMC AT STARTUP.
    pub fn with_probe(mut self, probe: Box<dyn BandwidthProbe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    pub fn run(mut self) -> Result<()> {
        let cfg = self.cfg.clone();
        let cores: Vec<usize> = (cfg.core_first..=cfg.core_last).collect();

        // SLOTS AND MODULE MAP. THE PRIMARY IS THE SMALLEST MONITORED
        // CORE OF EACH MODULE TOUCHED BY THE RANGE.
        let mut slots = Vec::with_capacity(cores.len());
        let mut modules: Vec<ModuleRt> = Vec::new();
        let mut module_ids: Vec<usize> = Vec::new();
        let mut module_priority: Vec<u32> = Vec::new();

        for (i, &core) in cores.iter().enumerate() {
            let module_id = module_of(core, cfg.cores_per_module);
            let is_primary = !module_ids.contains(&module_id);
            if is_primary {
                module_ids.push(module_id);
                modules.push(ModuleRt {
                    primary_slot: i,
                    current_msr: 0,
                });
                module_priority.push(0);
            }
            let midx = module_ids.iter().position(|&m| m == module_id).unwrap();
            module_priority[midx] += cfg.priorities[i];
            slots.push(CoreSlot::new(core, module_id, cfg.priorities[i], is_primary));
        }

        let controller = match cfg.algorithm {
            Algorithm::Heur => Controller::Heur(HeurState::new(modules.len(), 0, cfg.aggressiveness, false)),
            Algorithm::HeurPrio => {
                Controller::Heur(HeurState::new(modules.len(), 0, cfg.aggressiveness, true))
            }
            Algorithm::Mab => Controller::Mab(MabState::new(
                crate::bandit::arm_table(cfg.arm_table),
                MabParams {
                    epsilon: cfg.epsilon,
                    gamma: cfg.gamma,
                    exploration: cfg.exploration,
                    reward: cfg.reward,
                    dynamic_sd: cfg.dynamic_sd,
                    sd_window: cfg.sd_window,
                    seed: cfg.seed,
                },
            )),
        };
        let safe_msr = controller.safe_value();

        // EVERY MODULE STARTS AT THE SAFE VALUE; THE SAMPLERS PROGRAM
        // IT BEFORE THE FIRST TICK
        for module in &mut modules {
            module.current_msr = safe_msr;
        }

        let probe: Box<dyn BandwidthProbe> = match self.probe_override.take() {
            Some(p) => p,
            None if cfg.dry_run => Box::new(NullProbe),
            None => bandwidth::select_probe(self.backend.as_ref(), &cores)?,
        };
        info!(probe = probe.label(), "bandwidth probe selected");

        let selftest = match cfg.bw_mode {
            // THE ACCUMULATOR STARTS AT ZERO; EVERY SAMPLER ADDS ITS
            // MEASUREMENT BEFORE THE FIRST BARRIER ROUND
            BwMode::SelfTest => Some(Arc::new(AtomicU32::new(0))),
            _ => None,
        };

        let master = MasterCtx {
            probe,
            controller,
            modules,
            module_priority,
            target_mb_s: cfg.ddr_bw_target,
            log: TickLog::new(),
            dump_log: cfg.dump_log,
            tick: 0,
        };

        let slots = Arc::new(slots);
        let barrier = Arc::new(TickBarrier::new(cores.len() as u32));
        let interval = Duration::from_secs_f64(cfg.interval_s);

        // THE MASTER ROLE RIDES ON THE FIRST CORE'S SAMPLER
        let mut master = Some(master);
        let init_failed = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(cores.len());
        for (i, &core) in cores.iter().enumerate() {
            let ctx = SamplerCtx {
                core_id: core,
                slot_idx: i,
                interval,
                slots: Arc::clone(&slots),
                barrier: Arc::clone(&barrier),
                shutdown: Arc::clone(&self.shutdown),
                backend: Arc::clone(&self.backend),
                safe_msr,
                selftest: selftest.clone(),
                init_failed: Arc::clone(&init_failed),
                master: if i == 0 { master.take() } else { None },
            };
            handles.push(
                std::thread::Builder::new()
                    .name(format!("maxwell-core{}", core))
                    .spawn(move || sampler_loop(ctx))
                    .expect("thread spawn"),
            );
        }

        for h in handles {
            let _ = h.join();
        }

        if init_failed.load(Ordering::Relaxed) {
            bail!("sampler initialization failed, see log");
        }

        info!("all samplers joined");
        Ok(())
    }
}

// PIN THE CALLING THREAD TO ONE CORE. FATAL WHEN IT FAILS -- AN
// UNPINNED SAMPLER WOULD READ SOME OTHER CORE'S COUNTERS.
fn pin_to_core(core_id: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sampler_loop(mut ctx: SamplerCtx) {
    let slot = &ctx.slots[ctx.slot_idx];
    let is_master = ctx.master.is_some();

    if let Err(e) = pin_to_core(ctx.core_id) {
        error!(core = ctx.core_id, error = %e, "cannot pin sampler, shutting down");
        sampler_init_failed(&ctx);
        return;
    }

    let mut msr: Box<dyn MsrAccess> = match ctx.backend.open(ctx.core_id) {
        Ok(m) => m,
        Err(e) => {
            error!(core = ctx.core_id, error = %e, "cannot open MSR device, shutting down");
            sampler_init_failed(&ctx);
            return;
        }
    };

    // ONE-SHOT BANDWIDTH SELF-TEST: EVERY SAMPLER STREAMS, SUMS INTO
    // THE SHARED ACCUMULATOR, AND THE MASTER INSTALLS THE TOTAL AS THE
    // TARGET AFTER THE BARRIER ROUND
    if let Some(acc) = &ctx.selftest {
        let mb_s = bandwidth::selftest_stream_mb_s();
        acc.fetch_add(mb_s, Ordering::AcqRel);
        let gen = ctx.barrier.arrive();
        if is_master {
            if !ctx.barrier.wait_all(&ctx.shutdown) {
                ctx.barrier.release();
                return;
            }
            let total = acc.load(Ordering::Acquire);
            if total == 0 {
                error!("bandwidth self-test measured nothing, shutting down");
                sampler_init_failed(&ctx);
            } else {
                info!(mb_s = total, "bandwidth self-test complete");
                if let Some(master) = ctx.master.as_mut() {
                    master.target_mb_s = total;
                }
            }
            ctx.barrier.release();
        } else if !ctx.barrier.wait_release(gen, &ctx.shutdown) {
            return;
        }
    }

    // PROGRAM THE SAFE PREFETCHER VALUE AND THE COUNTERS BEFORE THE
    // FIRST TICK
    if slot.is_primary {
        if let Err(e) = msr.write(PREFETCH_CTRL_MSR, ctx.safe_msr) {
            warn!(core = ctx.core_id, error = %e, "initial prefetcher write failed");
        }
    }
    if let Err(e) = pmu::enable_fixed(msr.as_mut()) {
        error!(core = ctx.core_id, error = %e, "cannot enable fixed counters, shutting down");
        sampler_init_failed(&ctx);
        return;
    }
    if let Err(e) = pmu::configure_counters(msr.as_mut()) {
        error!(core = ctx.core_id, error = %e, "cannot program counters, shutting down");
        sampler_init_failed(&ctx);
        return;
    }

    // FIRST TICK PUBLISHES ZERO DELTAS -- THERE IS NO PRIOR SNAPSHOT
    let mut prev: Option<CounterSnapshot> = None;

    while !ctx.shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(ctx.interval);

        let delta = match pmu::read_counters(msr.as_mut()) {
            Ok(snap) => {
                let d = match &prev {
                    Some(p) => pmu::delta(p, &snap),
                    None => CounterDelta::default(),
                };
                prev = Some(snap);
                d
            }
            Err(e) => {
                // SAMPLER-LOCAL FAULT: PUBLISH ZEROS WITH THE FLAG BIT,
                // NEVER PROPAGATE TO THE MASTER
                warn!(core = ctx.core_id, error = %e, "counter read failed");
                CounterDelta {
                    suspect: true,
                    ..Default::default()
                }
            }
        };
        slot.publish(&delta);

        let gen = ctx.barrier.arrive();
        if is_master {
            let arrived = ctx.barrier.wait_all(&ctx.shutdown);
            if arrived {
                if let Some(master) = ctx.master.as_mut() {
                    master.tick(&ctx.slots);
                }
            }
            ctx.barrier.release();
            if !arrived {
                break;
            }
        } else if !ctx.barrier.wait_release(gen, &ctx.shutdown) {
            break;
        }

        // APPLY THE STAGED DECISION. EXACTLY ONE WRITE WHEN THE VALUE
        // CHANGED, ZERO OTHERWISE. A FAILED WRITE KEEPS THE STALE VALUE
        // AND THE LOOP GOING.
        if slot.is_primary {
            if let Some(value) = slot.take_staged() {
                if let Err(e) = msr.write(PREFETCH_CTRL_MSR, value) {
                    warn!(core = ctx.core_id, error = %e, "prefetcher write failed");
                }
            }
        }
    }

    // SHUTDOWN: RESTORE THE CONSERVATIVE SETTING BEFORE EXIT
    if slot.is_primary {
        if let Err(e) = msr.write(PREFETCH_CTRL_MSR, ctx.safe_msr) {
            warn!(core = ctx.core_id, error = %e, "prefetcher restore failed");
        }
    }

    if let Some(master) = ctx.master {
        if master.dump_log {
            master.log.dump();
        }
        master.log.summary();
    }

    info!(core = ctx.core_id, "sampler done");
}
