// src/utils/system.rs: System functions

use log::debug;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};


/// Default thread count for external tools: physical cores, else logical cores.
///
/// # Returns
///
/// usize thread count, at least 1
pub fn default_threads() -> usize {
    System::physical_core_count()
        .filter(|&cores| cores > 0)
        .unwrap_or_else(num_cpus::get)
        .max(1)
}


/// Finds the amount of total and available RAM.
///
/// # Returns
///
/// (u64, u64) total ram, available ram, in bytes. Zeros if undetectable.
pub fn detect_ram() -> (u64, u64) {
    let refresh_kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_memory();
    (system.total_memory(), system.available_memory())
}


/// Logs host resources at debug level before the run starts.
pub fn log_host_resources(threads: usize) {
    let (total_ram, available_ram) = detect_ram();
    debug!(
        "Detected {} physical cores ({} logical); tools will use {} threads",
        System::physical_core_count().unwrap_or(0),
        num_cpus::get(),
        threads
    );
    debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
    debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
}
