// STANDALONE BANDWIDTH PROBE -- ONE LINE PER SAMPLE UNTIL CTRL-C
// USEFUL FOR SANITY-CHECKING THE MBM/IMC PATH BEFORE A REAL RUN

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use crate::bandwidth;
use crate::msr::DevMsr;

static RUNNING: AtomicBool = AtomicBool::new(true);

pub fn run_probe(cores: (usize, usize), interval_s: f64) -> Result<()> {
    ctrlc::set_handler(move || {
        RUNNING.store(false, Ordering::Relaxed);
    })
    .ok();

    let core_list: Vec<usize> = (cores.0..=cores.1).collect();
    let backend = DevMsr;
    let mut probe = bandwidth::select_probe(&backend, &core_list)?;

    println!("PROBE: {} ({} cores)", probe.label(), core_list.len());

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs_f64(interval_s));
        println!("{}", probe.sample_mb_s());
    }

    Ok(())
}
