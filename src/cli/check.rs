// MAXWELL DEPENDENCY CHECK
// AUDITS EVERYTHING THE DAEMON NEEDS BEFORE IT TOUCHES A REGISTER.

use std::io::Read;
use std::path::Path;

use anyhow::Result;

use crate::bandwidth;
use crate::topology;

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let found =
        config.contains("CONFIG_X86_MSR=y") || config.contains("CONFIG_X86_MSR=m");
    if found {
        println!("  CONFIG_X86_MSR        OK");
    } else {
        println!("  CONFIG_X86_MSR        NOT FOUND -- the msr driver is unavailable");
    }
    found
}

pub fn run_check() -> Result<()> {
    println!("MAXWELL DEPENDENCY CHECK");
    println!();

    let mut ok = true;

    let msr_node = Path::new("/dev/cpu/0/msr");
    if msr_node.exists() {
        println!("  /dev/cpu/0/msr        OK");
    } else {
        println!("  /dev/cpu/0/msr        MISSING (modprobe msr)");
        ok = false;
    }

    println!();
    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    match topology::efficiency_cores() {
        Ok((first, last)) => {
            println!("  E-CORES               {}-{}", first, last);
        }
        Err(e) => {
            println!("  E-CORES               NOT DETECTED ({e})");
            println!("                        USE --core TO SET THE RANGE EXPLICITLY");
        }
    }

    if bandwidth::mbm_supported() {
        println!("  RDT MBM               SUPPORTED");
    } else {
        println!("  RDT MBM               NOT SUPPORTED (IMC FALLBACK, NEEDS /dev/mem)");
    }

    match topology::dmi_max_bandwidth_mb_s() {
        Some(mb_s) => println!("  DMI BANDWIDTH         {} MB/s THEORETICAL MAX", mb_s),
        None => {
            println!("  DMI BANDWIDTH         NOT READABLE");
            println!("                        USE --ddrbw-set OR --ddrbw-test");
        }
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
