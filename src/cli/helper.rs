// KERNEL-HELPER DRIVER -- EXERCISES THE PROC PROTOCOL END TO END

use anyhow::Result;

use crate::helper::HelperClient;

pub fn run_helper(action: &str, core_range: Option<(usize, usize)>, value: Option<u32>) -> Result<()> {
    let client = HelperClient::new();

    let version = client.init()?;
    println!("HELPER PROTOCOL VERSION {}", version);

    match action {
        "status" => {
            if let Some((first, last)) = core_range {
                let threads = client.set_core_range(first as u32, last as u32)?;
                println!("CORE RANGE {}-{} = {} THREADS", first, last, threads);
                let pmu = client.read_pmu(first as u32)?;
                println!("PMU[{}]: {:?}", first, pmu);
                let msrs = client.read_msrs(first as u32)?;
                for (i, v) in msrs.iter().enumerate() {
                    println!("MSR[0x{:X}]: 0x{:016X}", 0x1320 + i, v);
                }
            }
        }
        "enable" => {
            if let Some((first, last)) = core_range {
                client.set_core_range(first as u32, last as u32)?;
            }
            if let Some(mb_s) = value {
                let confirmed = client.set_ddr_bw_target(mb_s)?;
                println!("DDR BW TARGET {} MB/s", confirmed);
            }
            let on = client.set_tuning(true)?;
            println!("IN-KERNEL TUNING {}", if on { "ENABLED" } else { "REFUSED" });
        }
        "disable" => {
            let on = client.set_tuning(false)?;
            println!("IN-KERNEL TUNING {}", if on { "STILL ON" } else { "DISABLED" });
        }
        other => {
            anyhow::bail!("unknown helper action '{}' (status|enable|disable)", other);
        }
    }

    Ok(())
}
