// MAXWELL TICK LOG
// RECORDS ONE SNAPSHOT PER CONTROL TICK. PRE-ALLOCATED RING BUFFER, NO
// HEAP ALLOCATION WHILE THE LOOP RUNS. WRAPS AROUND AT CAPACITY --
// OLDEST ENTRIES OVERWRITTEN.

const MAX_SNAPSHOTS: usize = 8192;

#[derive(Clone, Copy)]
pub struct Snapshot {
    pub ts_ns: u64,
    pub bw_mb_s: u32,
    // FLEET IPC AND REWARD IN MILLI-UNITS TO KEEP THE RECORD INTEGRAL
    pub ipc_milli: u64,
    pub reward_milli: u64,
    // ARM INDEX (MAB) OR LADDER LEVEL OF MODULE 0 (HEUR)
    pub setting: u32,
    pub msr_writes: u32,
}

pub struct TickLog {
    snapshots: Vec<Snapshot>,
    head: usize,
    len: usize,
}

impl TickLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![
                Snapshot {
                    ts_ns: 0,
                    bw_mb_s: 0,
                    ipc_milli: 0,
                    reward_milli: 0,
                    setting: 0,
                    msr_writes: 0,
                };
                MAX_SNAPSHOTS
            ],
            head: 0,
            len: 0,
        }
    }

    // RECORD ONE TICK. CALLED ONCE PER TICK FROM THE MASTER, INSIDE THE
    // BARRIER-HELD WINDOW. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn snapshot(&mut self, bw_mb_s: u32, ipc: f64, reward: f64, setting: u32, msr_writes: u32) {
        self.snapshots[self.head] = Snapshot {
            ts_ns: now_ns(),
            bw_mb_s,
            ipc_milli: (ipc * 1000.0) as u64,
            reward_milli: (reward * 1000.0) as u64,
            setting,
            msr_writes,
        };
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| &self.snapshots[(start + i) % MAX_SNAPSHOTS])
    }

    // DUMP THE TIME SERIES AFTER THE RUN
    pub fn dump(&self) {
        if self.len == 0 {
            return;
        }

        let mut iter = self.iter_chronological();
        let first = iter.next().unwrap();
        let base_ts = first.ts_ns;

        println!(
            "\n{:<10} {:<10} {:<10} {:<12} {:<8} {:<8}",
            "TIME_S", "BW_MB/S", "IPC_MILLI", "REWARD_MILLI", "SETTING", "WRITES"
        );
        println!("{}", "-".repeat(62));

        println!(
            "{:<10.1} {:<10} {:<10} {:<12} {:<8} {:<8}",
            0.0, first.bw_mb_s, first.ipc_milli, first.reward_milli, first.setting,
            first.msr_writes
        );

        for s in iter {
            let elapsed_s = (s.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            println!(
                "{:<10.1} {:<10} {:<10} {:<12} {:<8} {:<8}",
                elapsed_s, s.bw_mb_s, s.ipc_milli, s.reward_milli, s.setting, s.msr_writes
            );
        }

        if self.len == MAX_SNAPSHOTS {
            println!(
                "\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} TICKS)",
                MAX_SNAPSHOTS
            );
        }
        println!("TOTAL TICKS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter_chronological().collect();

        let total_writes: u64 = snapshots.iter().map(|s| s.msr_writes as u64).sum();
        let avg_bw: u64 =
            snapshots.iter().map(|s| s.bw_mb_s as u64).sum::<u64>() / snapshots.len() as u64;
        let peak_bw = snapshots.iter().map(|s| s.bw_mb_s).max().unwrap_or(0);
        let avg_ipc: u64 =
            snapshots.iter().map(|s| s.ipc_milli).sum::<u64>() / snapshots.len() as u64;

        let setting_changes = snapshots
            .windows(2)
            .filter(|w| w[0].setting != w[1].setting)
            .count();

        let elapsed_ns = snapshots.last().unwrap().ts_ns - snapshots.first().unwrap().ts_ns;
        let elapsed_s = elapsed_ns as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("MAXWELL SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  TICKS:             {}", self.len);
        println!("  AVG BANDWIDTH:     {} MB/s", avg_bw);
        println!("  PEAK BANDWIDTH:    {} MB/s", peak_bw);
        println!("  AVG FLEET IPC:     {:.3}", avg_ipc as f64 / 1000.0);
        println!("  SETTING CHANGES:   {}", setting_changes);
        println!("  MSR WRITES:        {}", total_writes);
        println!("  ELAPSED:           {:.1}s", elapsed_s);
    }
}

impl Default for TickLog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_records() {
        let mut log = TickLog::new();
        assert_eq!(log.len, 0);

        log.snapshot(9600, 1.25, 0.8, 3, 2);
        assert_eq!(log.len, 1);
        assert_eq!(log.snapshots[0].bw_mb_s, 9600);
        assert_eq!(log.snapshots[0].ipc_milli, 1250);
        assert_eq!(log.snapshots[0].reward_milli, 800);
        assert_eq!(log.snapshots[0].setting, 3);
        assert_eq!(log.snapshots[0].msr_writes, 2);
        assert!(log.snapshots[0].ts_ns > 0);
    }

    #[test]
    fn ring_buffer_wraps() {
        let mut log = TickLog::new();

        for i in 0..MAX_SNAPSHOTS {
            log.snapshot(i as u32, 0.0, 0.0, 0, 0);
        }
        assert_eq!(log.len, MAX_SNAPSHOTS);
        assert_eq!(log.head, 0); // WRAPPED BACK TO START

        log.snapshot(99999, 0.0, 0.0, 0, 0);
        assert_eq!(log.len, MAX_SNAPSHOTS);
        assert_eq!(log.head, 1);
        assert_eq!(log.snapshots[0].bw_mb_s, 99999);

        let ordered: Vec<u32> = log.iter_chronological().map(|s| s.bw_mb_s).collect();
        assert_eq!(ordered[0], 1); // OLDEST SURVIVING ENTRY
        assert_eq!(*ordered.last().unwrap(), 99999); // NEWEST
        assert_eq!(ordered.len(), MAX_SNAPSHOTS);
    }

    #[test]
    fn summary_no_panic_short() {
        let log = TickLog::new();
        log.summary(); // 0 TICKS

        let mut log = TickLog::new();
        log.snapshot(100, 1.0, 1.0, 0, 0);
        log.summary(); // 1 TICK
    }

    #[test]
    fn dump_no_panic() {
        let mut log = TickLog::new();
        log.snapshot(9600, 1.0, 0.9, 2, 1);
        log.snapshot(10200, 1.1, 0.8, 1, 1);
        log.dump();
    }
}
