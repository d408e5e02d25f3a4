// MAXWELL KERNEL-HELPER PROTOCOL
// CLIENT FOR THE OPTIONAL PRIVILEGED HELPER THAT RUNS THE SAME CONTROL
// LOOP OFF AN IN-KERNEL TIMER. ONE PROC ENDPOINT, WRITE A REQUEST THEN
// READ THE ONE-SHOT RESPONSE (THE BUFFER RESETS ON THE NEXT WRITE).
//
// FRAMES ARE #[repr(C)] LITTLE-ENDIAN STRUCTS SHARING AN 8-BYTE
// HEADER. LAYOUT IS ABI -- THE TESTS PIN EVERY SIZE.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub const HELPER_PROC_PATH: &str = "/proc/maxwell_monitor";

// NUMBER OF PMU VALUES IN A PMU_READ RESPONSE
pub const HELPER_PMU_COUNTERS: usize = 7;
// MODULE PREFETCH MSRS REPORTED BY MSR_READ (0x1320..0x1324)
pub const NR_OF_MSR: usize = 5;

pub const MSG_INIT: u32 = 1;
pub const MSG_CORE_RANGE: u32 = 2;
pub const MSG_CORE_WEIGHT: u32 = 3;
pub const MSG_TUNING: u32 = 4;
pub const MSG_DDRBW_SET: u32 = 5;
pub const MSG_PMU_READ: u32 = 6;
pub const MSG_MSR_READ: u32 = 7;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: u32,
    pub payload_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespInit {
    pub header: MsgHeader,
    pub version: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReqCoreRange {
    pub header: MsgHeader,
    pub core_start: u32,
    pub core_end: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespCoreRange {
    pub header: MsgHeader,
    pub core_start: u32,
    pub core_end: u32,
    pub thread_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReqTuning {
    pub header: MsgHeader,
    pub enable: u8,
    pub _pad: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespTuning {
    pub header: MsgHeader,
    pub status: u8,
    pub _pad: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReqDdrbwSet {
    pub header: MsgHeader,
    pub set_value: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespDdrbwSet {
    pub header: MsgHeader,
    pub confirmed_value: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReqCoreId {
    pub header: MsgHeader,
    pub core_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespPmuRead {
    pub header: MsgHeader,
    pub core_id: u32,
    pub _pad: u32,
    pub pmu_values: [u64; HELPER_PMU_COUNTERS],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RespMsrRead {
    pub header: MsgHeader,
    pub core_id: u32,
    pub _pad: u32,
    pub msr_values: [u64; NR_OF_MSR],
}

// CORE_WEIGHT CARRIES A VARIABLE-LENGTH u32 ARRAY AFTER A FIXED HEAD
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CoreWeightHead {
    pub header: MsgHeader,
    pub count: u32,
}

pub fn header(msg_type: u32, payload_size: usize) -> MsgHeader {
    MsgHeader {
        msg_type,
        payload_size: payload_size as u32,
    }
}

// FRAME A FIXED-LAYOUT STRUCT AS BYTES
fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

// DECODE A FIXED-LAYOUT STRUCT, CHECKING LENGTH AND MESSAGE TYPE
fn decode<T: Copy>(buf: &[u8], expect_type: u32) -> Result<T> {
    if buf.len() < std::mem::size_of::<T>() {
        bail!(
            "helper response too short: {} < {}",
            buf.len(),
            std::mem::size_of::<T>()
        );
    }
    let head: MsgHeader = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const MsgHeader) };
    if head.msg_type != expect_type {
        bail!(
            "helper response type {} where {} expected",
            head.msg_type,
            expect_type
        );
    }
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

pub struct HelperClient {
    path: PathBuf,
}

impl HelperClient {
    pub fn new() -> Self {
        Self::at(HELPER_PROC_PATH)
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    // WRITE THE REQUEST, READ THE ONE-SHOT RESPONSE
    fn transact(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("helper endpoint {} not available", self.path.display()))?;
        file.write_all(request).context("helper request write")?;

        // THE RESPONSE IS READ FROM OFFSET ZERO OF THE SAME ENDPOINT
        file.seek(SeekFrom::Start(0)).context("helper seek")?;
        let mut resp = Vec::new();
        file.read_to_end(&mut resp).context("helper response read")?;
        Ok(resp)
    }

    pub fn init(&self) -> Result<u32> {
        let req = MsgHeader {
            msg_type: MSG_INIT,
            payload_size: std::mem::size_of::<MsgHeader>() as u32,
        };
        let resp: RespInit = decode(&self.transact(as_bytes(&req))?, MSG_INIT)?;
        Ok(resp.version)
    }

    pub fn set_core_range(&self, first: u32, last: u32) -> Result<u32> {
        let req = ReqCoreRange {
            header: header(MSG_CORE_RANGE, std::mem::size_of::<ReqCoreRange>()),
            core_start: first,
            core_end: last,
        };
        let resp: RespCoreRange = decode(&self.transact(as_bytes(&req))?, MSG_CORE_RANGE)?;
        Ok(resp.thread_count)
    }

    pub fn set_core_weights(&self, weights: &[u32]) -> Result<Vec<u32>> {
        let head = CoreWeightHead {
            header: header(
                MSG_CORE_WEIGHT,
                std::mem::size_of::<CoreWeightHead>() + weights.len() * 4,
            ),
            count: weights.len() as u32,
        };
        let mut req = as_bytes(&head).to_vec();
        for w in weights {
            req.extend_from_slice(&w.to_le_bytes());
        }

        let resp = self.transact(&req)?;
        let confirmed_head: CoreWeightHead = decode(&resp, MSG_CORE_WEIGHT)?;
        let base = std::mem::size_of::<CoreWeightHead>();
        let count = confirmed_head.count as usize;
        if resp.len() < base + count * 4 {
            bail!("helper confirmed {} weights but payload is short", count);
        }
        Ok((0..count)
            .map(|i| {
                u32::from_le_bytes(resp[base + i * 4..base + i * 4 + 4].try_into().unwrap())
            })
            .collect())
    }

    pub fn set_tuning(&self, enable: bool) -> Result<bool> {
        let req = ReqTuning {
            header: header(MSG_TUNING, std::mem::size_of::<ReqTuning>()),
            enable: enable as u8,
            _pad: [0; 3],
        };
        let resp: RespTuning = decode(&self.transact(as_bytes(&req))?, MSG_TUNING)?;
        Ok(resp.status != 0)
    }

    pub fn set_ddr_bw_target(&self, mb_s: u32) -> Result<u32> {
        let req = ReqDdrbwSet {
            header: header(MSG_DDRBW_SET, std::mem::size_of::<ReqDdrbwSet>()),
            set_value: mb_s,
        };
        let resp: RespDdrbwSet = decode(&self.transact(as_bytes(&req))?, MSG_DDRBW_SET)?;
        Ok(resp.confirmed_value)
    }

    pub fn read_pmu(&self, core_id: u32) -> Result<[u64; HELPER_PMU_COUNTERS]> {
        let req = ReqCoreId {
            header: header(MSG_PMU_READ, std::mem::size_of::<ReqCoreId>()),
            core_id,
        };
        let resp: RespPmuRead = decode(&self.transact(as_bytes(&req))?, MSG_PMU_READ)?;
        Ok(resp.pmu_values)
    }

    pub fn read_msrs(&self, core_id: u32) -> Result<[u64; NR_OF_MSR]> {
        let req = ReqCoreId {
            header: header(MSG_MSR_READ, std::mem::size_of::<ReqCoreId>()),
            core_id,
        };
        let resp: RespMsrRead = decode(&self.transact(as_bytes(&req))?, MSG_MSR_READ)?;
        Ok(resp.msr_values)
    }
}

impl Default for HelperClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layouts_are_abi() {
        // HEADER IS TWO u32S, EVERYTHING ELSE PACKS WITHOUT SURPRISES
        assert_eq!(std::mem::size_of::<MsgHeader>(), 8);
        assert_eq!(std::mem::size_of::<RespInit>(), 12);
        assert_eq!(std::mem::size_of::<ReqCoreRange>(), 16);
        assert_eq!(std::mem::size_of::<RespCoreRange>(), 20);
        assert_eq!(std::mem::size_of::<ReqTuning>(), 12);
        assert_eq!(std::mem::size_of::<ReqDdrbwSet>(), 12);
        assert_eq!(std::mem::size_of::<ReqCoreId>(), 12);
        assert_eq!(std::mem::size_of::<CoreWeightHead>(), 12);
        assert_eq!(
            std::mem::size_of::<RespPmuRead>(),
            16 + HELPER_PMU_COUNTERS * 8
        );
        assert_eq!(std::mem::size_of::<RespMsrRead>(), 16 + NR_OF_MSR * 8);
    }

    #[test]
    fn decode_checks_type_and_length() {
        let good = RespInit {
            header: header(MSG_INIT, std::mem::size_of::<RespInit>()),
            version: 3,
        };
        let decoded: RespInit = decode(as_bytes(&good), MSG_INIT).unwrap();
        assert_eq!(decoded.version, 3);

        assert!(decode::<RespInit>(&[0u8; 4], MSG_INIT).is_err());
        assert!(decode::<RespInit>(as_bytes(&good), MSG_TUNING).is_err());
    }

    #[test]
    fn transact_echoes_through_a_file() {
        // A PLAIN FILE ECHOES THE REQUEST BACK. DDRBW REQUEST AND
        // RESPONSE SHARE A LAYOUT, SO THE ECHO EXERCISES THE FULL
        // WRITE-SEEK-READ-DECODE PATH WITHOUT THE KERNEL SIDE.
        let dir = std::env::temp_dir().join(format!("maxwell-helper-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("endpoint");
        std::fs::write(&path, b"").unwrap();

        let client = HelperClient::at(&path);
        let confirmed = client.set_ddr_bw_target(46000).unwrap();
        assert_eq!(confirmed, 46000);

        std::fs::remove_dir_all(&dir).ok();
    }
}
