// MAXWELL BANDWIDTH PROBES
// ONE SAMPLE PER TICK, OWNED BY THE MASTER. TWO IMPLEMENTATIONS:
//   MBM -- PER-CORE RMIDS, SUMMED QOS MONITORING COUNTERS (SERVERS)
//   IMC -- MEMORY CONTROLLER CAS COUNTERS OVER MCHBAR MMIO (CLIENTS)
// A PROBE THAT CANNOT DELIVER A SAMPLE REPORTS 0. CONTROLLERS TREAT 0
// AS UNKNOWN AND NEVER RAISE AGGRESSIVENESS ON IT.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::time::Instant;

use tracing::{info, warn};

use crate::error::DeviceError;
use crate::msr::{MsrAccess, MsrBackend};

pub trait BandwidthProbe: Send {
    fn sample_mb_s(&mut self) -> u32;
    fn label(&self) -> &'static str;
}

// --- RDT MBM (QOS MONITORING) REGISTERS ---

pub const IA32_QM_EVTSEL: u32 = 0xC8D;
pub const IA32_QM_CTR: u32 = 0xC8E;
pub const IA32_PQR_ASSOC: u32 = 0xC8F;

// EVENT ID 0x02 = LOCAL MEMORY BANDWIDTH
const MBM_LOCAL_BW: u64 = 0x02;

// QM_CTR STATUS BITS
const QM_CTR_ERROR: u64 = 1 << 63;
const QM_CTR_UNAVAIL: u64 = 1 << 62;
const QM_CTR_MASK: u64 = (1 << 62) - 1;

#[cfg(target_arch = "x86_64")]
fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    (r.eax, r.ebx, r.ecx, r.edx)
}

#[cfg(not(target_arch = "x86_64"))]
fn cpuid(_leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
    (0, 0, 0, 0)
}

// CPUID.(7,0):EBX[12] = PQM, THEN CPUID.(0xF,1):EDX[1] = TOTAL BW EVENT
pub fn mbm_supported() -> bool {
    let (_, ebx, _, _) = cpuid(0x7, 0);
    if ebx & (1 << 12) == 0 {
        return false;
    }
    let (_, _, _, edx) = cpuid(0xF, 1);
    edx & 0b10 != 0
}

pub struct MbmProbe {
    // QM_EVTSEL/QM_CTR ARE PACKAGE-SCOPED; ONE HANDLE IS ENOUGH
    qm: Box<dyn MsrAccess>,
    rmids: Vec<u32>,
    prev: Vec<u64>,
    // CPUID.(0xF,1):EBX -- BYTES PER COUNTER UNIT
    scale: u64,
    last: Instant,
}

impl MbmProbe {
    pub fn new(backend: &dyn MsrBackend, cores: &[usize]) -> Result<Self, DeviceError> {
        if cores.is_empty() {
            return Err(DeviceError::ProbeInit("no cores to monitor".into()));
        }

        let (_, scale, max_rmid, _) = cpuid(0xF, 1);
        let scale = if scale == 0 { 1 } else { scale as u64 };

        // RMID 0 IS THE KERNEL DEFAULT GROUP; ASSIGN 1..N
        let mut rmids = Vec::with_capacity(cores.len());
        for (i, core) in cores.iter().enumerate() {
            let rmid = i as u32 + 1;
            if max_rmid != 0 && rmid > max_rmid {
                return Err(DeviceError::ProbeInit(format!(
                    "rmid {} exceeds platform max {}",
                    rmid, max_rmid
                )));
            }
            let mut handle = backend.open(*core)?;
            handle.write(IA32_PQR_ASSOC, rmid as u64)?;
            rmids.push(rmid);
        }

        let mut probe = Self {
            qm: backend.open(cores[0])?,
            prev: vec![0; rmids.len()],
            rmids,
            scale,
            last: Instant::now(),
        };

        // PRIME THE PREVIOUS-VALUE VECTOR SO THE FIRST TICK DELTA IS SANE
        for i in 0..probe.rmids.len() {
            let v = probe.read_rmid(i).unwrap_or(0);
            probe.prev[i] = v;
        }

        info!(rmids = probe.rmids.len(), scale, "mbm probe ready");
        Ok(probe)
    }

    fn read_rmid(&mut self, idx: usize) -> Result<u64, DeviceError> {
        let rmid = self.rmids[idx] as u64;
        self.qm.write(IA32_QM_EVTSEL, (MBM_LOCAL_BW << 32) | rmid)?;
        let raw = self.qm.read(IA32_QM_CTR)?;
        if raw & (QM_CTR_ERROR | QM_CTR_UNAVAIL) != 0 {
            return Ok(self.prev[idx]); // HOLD -- COUNTS AS ZERO DELTA
        }
        Ok(raw & QM_CTR_MASK)
    }
}

impl BandwidthProbe for MbmProbe {
    fn sample_mb_s(&mut self) -> u32 {
        let dt = self.last.elapsed().as_secs_f64();
        self.last = Instant::now();
        if dt <= 0.0 {
            return 0;
        }

        let mut bytes: u64 = 0;
        for i in 0..self.rmids.len() {
            match self.read_rmid(i) {
                Ok(v) => {
                    bytes += v.wrapping_sub(self.prev[i]).wrapping_mul(self.scale);
                    self.prev[i] = v;
                }
                Err(e) => {
                    warn!(error = %e, "mbm sample failed, reporting unknown");
                    return 0;
                }
            }
        }

        (bytes as f64 / dt / 1e6) as u32
    }

    fn label(&self) -> &'static str {
        "MBM"
    }
}

// --- IMC (MCHBAR MMIO) ---

// CLIENT MEMORY CONTROLLER COUNTERS, 32-BIT CACHE-LINE COUNTS
pub const DEFAULT_MCHBAR: u64 = 0xFEDC_0000;
const IMC_MAP_LEN: usize = 0x6000;
const DRAM_DATA_READS: usize = 0x5050;
const DRAM_DATA_WRITES: usize = 0x5054;
const CACHE_LINE_BYTES: u64 = 64;

pub struct ImcProbe {
    map: *const u8,
    prev_reads: u32,
    prev_writes: u32,
    last: Instant,
}

// THE MAPPING IS PRIVATE TO THE MASTER THREAD; THE RAW POINTER NEVER
// LEAVES THE PROBE
unsafe impl Send for ImcProbe {}

impl ImcProbe {
    pub fn new(mchbar: u64) -> Result<Self, DeviceError> {
        let path = "/dev/mem";
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|source| DeviceError::Mmap {
                path: path.to_string(),
                source,
            })?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                IMC_MAP_LEN,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                mchbar as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DeviceError::Mmap {
                path: path.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        let mut probe = Self {
            map: ptr as *const u8,
            prev_reads: 0,
            prev_writes: 0,
            last: Instant::now(),
        };
        probe.prev_reads = probe.counter(DRAM_DATA_READS);
        probe.prev_writes = probe.counter(DRAM_DATA_WRITES);

        info!("imc probe ready at mchbar 0x{:X}", mchbar);
        Ok(probe)
    }

    fn counter(&self, offset: usize) -> u32 {
        unsafe { (self.map.add(offset) as *const u32).read_volatile() }
    }
}

impl BandwidthProbe for ImcProbe {
    fn sample_mb_s(&mut self) -> u32 {
        let dt = self.last.elapsed().as_secs_f64();
        self.last = Instant::now();
        if dt <= 0.0 {
            return 0;
        }

        let reads = self.counter(DRAM_DATA_READS);
        let writes = self.counter(DRAM_DATA_WRITES);
        let lines = reads.wrapping_sub(self.prev_reads) as u64
            + writes.wrapping_sub(self.prev_writes) as u64;
        self.prev_reads = reads;
        self.prev_writes = writes;

        (lines.wrapping_mul(CACHE_LINE_BYTES) as f64 / dt / 1e6) as u32
    }

    fn label(&self) -> &'static str {
        "IMC"
    }
}

impl Drop for ImcProbe {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, IMC_MAP_LEN);
        }
    }
}

// --- NULL PROBE (--dry-run) ---

pub struct NullProbe;

impl BandwidthProbe for NullProbe {
    fn sample_mb_s(&mut self) -> u32 {
        0
    }

    fn label(&self) -> &'static str {
        "NULL"
    }
}

// PREFER MBM WHEN THE CPU REPORTS SUPPORT, FALL BACK TO THE MEMORY
// CONTROLLER READER. INIT FAILURE OF THE SELECTED PROBE IS FATAL.
pub fn select_probe(
    backend: &dyn MsrBackend,
    cores: &[usize],
) -> Result<Box<dyn BandwidthProbe>, DeviceError> {
    if mbm_supported() {
        Ok(Box::new(MbmProbe::new(backend, cores)?))
    } else {
        Ok(Box::new(ImcProbe::new(DEFAULT_MCHBAR)?))
    }
}

// --- STREAMING SELF-TEST ---
// ONE PASS OF THE ONE-SHOT BANDWIDTH SELF-TEST, RUN BY EVERY SAMPLER
// THREAD BEFORE THE MAIN LOOP IN --ddrbw-test MODE. SHORT BUT HEAVY
// LOAD ON THE MEMORY SUBSYSTEM.

const SELFTEST_WORDS: usize = 8 * 1024 * 1024; // 64 MIB OF u64
const SELFTEST_PASSES: usize = 4;

pub fn selftest_stream_mb_s() -> u32 {
    let mut buf = vec![0u64; SELFTEST_WORDS];
    let start = Instant::now();
    let mut acc = 0u64;

    for pass in 0..SELFTEST_PASSES {
        for (i, word) in buf.iter_mut().enumerate() {
            *word = (i as u64).wrapping_add(pass as u64);
        }
        for word in &buf {
            acc = acc.wrapping_add(*word);
        }
    }

    std::hint::black_box(acc);

    let dt = start.elapsed().as_secs_f64();
    if dt <= 0.0 {
        return 0;
    }
    // ONE WRITE PASS + ONE READ PASS PER ITERATION
    let bytes = (SELFTEST_WORDS * 8 * 2 * SELFTEST_PASSES) as f64;
    (bytes / dt / 1e6) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msr::{MsrBackend, ShadowMsr};

    #[test]
    fn mbm_assigns_sequential_rmids() {
        let shadow = ShadowMsr::new();
        let probe = MbmProbe::new(&shadow, &[8, 9, 10]);
        // CPUID GATING DOES NOT APPLY TO DIRECT CONSTRUCTION; THE SHADOW
        // BACKEND ACCEPTS THE ASSOC WRITES
        let probe = probe.unwrap();
        assert_eq!(probe.rmids, vec![1, 2, 3]);
        assert_eq!(shadow.value(8, IA32_PQR_ASSOC), 1);
        assert_eq!(shadow.value(9, IA32_PQR_ASSOC), 2);
        assert_eq!(shadow.value(10, IA32_PQR_ASSOC), 3);
    }

    #[test]
    fn mbm_sums_deltas_across_rmids() {
        let shadow = ShadowMsr::new();
        let mut probe = MbmProbe::new(&shadow, &[0, 1]).unwrap();
        // THE SHADOW QM_CTR IGNORES EVTSEL SELECTION, SO BOTH RMIDS SEE
        // THE SAME COUNTER; GOOD ENOUGH TO EXERCISE THE DELTA PATH
        shadow.preload(0, IA32_QM_CTR, 1_000_000);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mb_s = probe.sample_mb_s();
        assert!(mb_s > 0);
    }

    #[test]
    fn null_probe_is_unknown() {
        assert_eq!(NullProbe.sample_mb_s(), 0);
    }
}
