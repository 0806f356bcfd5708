//! Process health heartbeat

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessExt, System, SystemExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const BYTES_PER_MIB: f64 = 1_048_576.0;

#[derive(Debug)]
pub enum HeartbeatError {
    /// The current process could not be inspected
    ProcessNotFound,
    Unavailable(String),
}

impl std::fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatError::ProcessNotFound => write!(f, "Process information not available"),
            HeartbeatError::Unavailable(msg) => write!(f, "Memory information unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// One memory reading, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
}

pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemorySample, HeartbeatError>;
}

/// Reads memory usage of the running process through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Result<Self, HeartbeatError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| HeartbeatError::Unavailable(e.to_string()))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> Result<MemorySample, HeartbeatError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        if !system.refresh_process(self.pid) {
            return Err(HeartbeatError::ProcessNotFound);
        }
        let process = system
            .process(self.pid)
            .ok_or(HeartbeatError::ProcessNotFound)?;

        Ok(MemorySample {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            system_used_bytes: system.used_memory(),
            system_total_bytes: system.total_memory(),
        })
    }
}

fn mib(bytes: u64) -> String {
    format!("{:.3}", bytes as f64 / BYTES_PER_MIB)
}

/// Log memory telemetry every `interval` until cancelled
pub async fn run(
    service_name: String,
    interval: Duration,
    probe: Arc<dyn MemoryProbe>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        match probe.sample() {
            Ok(sample) => info!(
                service = %service_name,
                total_mib = %mib(sample.resident_bytes),
                virtual_mib = %mib(sample.virtual_bytes),
                memory_load_mib = %mib(sample.system_used_bytes),
                "Heartbeat for service {}",
                service_name
            ),
            Err(e) => error!(service = %service_name, "Heartbeat failed: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(service = %service_name, "Heartbeat stopped");
}
