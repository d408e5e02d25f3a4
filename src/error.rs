// MAXWELL ERROR TAXONOMY
// STARTUP ERRORS ARE FATAL AND PRINT A SINGLE CATEGORY LINE.
// STEADY-STATE FAULTS NEVER CROSS THREAD BOUNDARIES -- SAMPLERS PUBLISH
// ZEROED SAMPLES WITH THE FAULT BIT SET AND KEEP RUNNING.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {flag}: {value}")]
    BadFlag { flag: &'static str, value: String },

    #[error("core priority {0} out of range (0-99)")]
    PriorityRange(i64),

    #[error("empty core set ({first}-{last})")]
    EmptyCoreSet { first: usize, last: usize },

    #[error("no DDR bandwidth target set or detected")]
    NoBandwidthTarget,
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("no efficiency cores found ({0})")]
    NoCores(String),

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot open MSR device for core {core}: {source}")]
    Open { core: usize, source: std::io::Error },

    #[error("MSR read 0x{reg:X} failed on core {core}: {source}")]
    Read {
        core: usize,
        reg: u32,
        source: std::io::Error,
    },

    #[error("MSR write 0x{reg:X} failed on core {core}: {source}")]
    Write {
        core: usize,
        reg: u32,
        source: std::io::Error,
    },

    #[error("bandwidth probe init failed: {0}")]
    ProbeInit(String),

    #[error("cannot map {path}: {source}")]
    Mmap {
        path: String,
        source: std::io::Error,
    },
}
