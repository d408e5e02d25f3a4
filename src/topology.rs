// MAXWELL TOPOLOGY AND PLATFORM DISCOVERY
// E-CORE RANGE FROM SYSFS, MODULE MAPPING, AND THE DMI/SMBIOS WALK THAT
// FEEDS THE DEFAULT BANDWIDTH TARGET. ALL READ-ONLY, ALL AT STARTUP.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::TopologyError;

const CPU_ATOM_NODE: &str = "/sys/devices/cpu_atom/cpus";
const DMI_ENTRIES: &str = "/sys/firmware/dmi/entries";

// AUTO-DETECT THE ATOM E-CORE RANGE. HYBRID CLIENTS EXPOSE THE E-CORE
// SET AS A RANGE STRING ("8-15"); E-CORE-ONLY SERVERS EXPOSE ALL CORES.
pub fn efficiency_cores() -> Result<(usize, usize), TopologyError> {
    let raw = fs::read_to_string(CPU_ATOM_NODE).map_err(|source| TopologyError::Unreadable {
        path: CPU_ATOM_NODE.to_string(),
        source,
    })?;
    parse_cpu_list(raw.trim()).ok_or_else(|| TopologyError::NoCores(raw.trim().to_string()))
}

// PARSE "8-15", "4", OR "0-3,8-15" (FIRST..LAST ACROSS ALL GROUPS)
pub fn parse_cpu_list(raw: &str) -> Option<(usize, usize)> {
    let mut first: Option<usize> = None;
    let mut last: Option<usize> = None;

    for group in raw.split(',') {
        let (a, b) = match group.split_once('-') {
            Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
            None => {
                let v = group.trim().parse().ok()?;
                (v, v)
            }
        };
        first = Some(first.map_or(a, |f: usize| f.min(a)));
        last = Some(last.map_or(b, |l: usize| l.max(b)));
    }

    match (first, last) {
        (Some(f), Some(l)) if l >= f => Some((f, l)),
        _ => None,
    }
}

// MODULE MAPPING: FOUR CORES SHARE ONE PREFETCHER MSR ON THE TARGET
// PARTS. THE PRIMARY CORE IS THE SMALLEST MONITORED CORE IN THE MODULE.
pub fn module_of(core_id: usize, cores_per_module: usize) -> usize {
    core_id / cores_per_module
}

// THEORETICAL MAX DRAM BANDWIDTH FROM SMBIOS TYPE 17 (MEMORY DEVICE)
// RECORDS: SUM OF CONFIGURED-SPEED(MT/s) * DATA-WIDTH(BYTES) OVER ALL
// POPULATED DEVICES. MT/s * BYTES = MB/s PER CHANNEL.
pub fn dmi_max_bandwidth_mb_s() -> Option<u32> {
    dmi_scan(Path::new(DMI_ENTRIES))
}

fn dmi_scan(entries: &Path) -> Option<u32> {
    let mut total: u64 = 0;

    for entry in fs::read_dir(entries).ok()? {
        let entry = entry.ok()?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("17-") {
            continue;
        }
        let raw = fs::read(entry.path().join("raw")).ok()?;
        if let Some(mb_s) = memory_device_mb_s(&raw) {
            debug!(device = %name.to_string_lossy(), mb_s, "dmi memory device");
            total += mb_s as u64;
        }
    }

    if total == 0 {
        None
    } else {
        Some(total.min(u32::MAX as u64) as u32)
    }
}

// SMBIOS TYPE 17 LAYOUT (OFFSETS INTO THE FORMATTED AREA):
//   0x0A DATA WIDTH (u16, BITS)   0x0C SIZE (u16, 0 = EMPTY SLOT)
//   0x15 SPEED (u16, MT/s)        0x20 CONFIGURED SPEED (u16, MT/s)
fn memory_device_mb_s(raw: &[u8]) -> Option<u32> {
    if raw.len() < 0x17 || raw[0] != 17 {
        return None;
    }

    let u16_at = |off: usize| -> u16 { u16::from_le_bytes([raw[off], raw[off + 1]]) };

    let size = u16_at(0x0C);
    if size == 0 {
        return None; // EMPTY SLOT
    }

    let data_width = u16_at(0x0A);
    if data_width == 0 || data_width == 0xFFFF {
        return None;
    }

    // PREFER CONFIGURED SPEED WHEN THE RECORD IS LONG ENOUGH AND SET
    let speed = if raw.len() >= 0x22 && u16_at(0x20) != 0 {
        u16_at(0x20)
    } else {
        u16_at(0x15)
    };
    if speed == 0 {
        return None;
    }

    Some(speed as u32 * (data_width as u32 / 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_list_forms() {
        assert_eq!(parse_cpu_list("8-15"), Some((8, 15)));
        assert_eq!(parse_cpu_list("4"), Some((4, 4)));
        assert_eq!(parse_cpu_list("0-3,8-15"), Some((0, 15)));
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("x-y"), None);
    }

    #[test]
    fn module_mapping() {
        assert_eq!(module_of(0, 4), 0);
        assert_eq!(module_of(7, 4), 1);
        assert_eq!(module_of(8, 4), 2);
    }

    #[test]
    fn memory_device_math() {
        // TYPE 17, 64-BIT WIDE, 8 GIB, 4800 MT/s CONFIGURED
        let mut raw = vec![0u8; 0x28];
        raw[0] = 17;
        raw[0x0A] = 64; // DATA WIDTH
        raw[0x0C] = 0x00;
        raw[0x0D] = 0x20; // SIZE != 0
        raw[0x15..0x17].copy_from_slice(&4400u16.to_le_bytes());
        raw[0x20..0x22].copy_from_slice(&4800u16.to_le_bytes());
        assert_eq!(memory_device_mb_s(&raw), Some(4800 * 8));
    }

    #[test]
    fn memory_device_skips_empty_slot() {
        let mut raw = vec![0u8; 0x28];
        raw[0] = 17;
        raw[0x0A] = 64;
        // SIZE == 0
        assert_eq!(memory_device_mb_s(&raw), None);
    }

    #[test]
    fn memory_device_falls_back_to_speed() {
        let mut raw = vec![0u8; 0x17];
        raw[0] = 17;
        raw[0x0A] = 64;
        raw[0x0D] = 0x20;
        raw[0x15..0x17].copy_from_slice(&3200u16.to_le_bytes());
        assert_eq!(memory_device_mb_s(&raw), Some(3200 * 8));
    }
}
