//! Power backends.
//!
//! Each backend probes for its interface in its constructor and returns
//! [`PowerError::Unavailable`] when the interface is missing, so callers can
//! leave that domain out instead of recording nothing.

pub mod amd_cpu;
pub mod amd_gpu;
pub mod ipmi;
pub mod nvidia_smi;
pub mod racadm;
pub mod rapl;
pub mod redfish;

#[cfg(feature = "nvml")]
pub mod nvml;

pub use amd_cpu::{AmdCpuConfig, AmdCpuSource};
pub use amd_gpu::{AmdGpuConfig, AmdGpuSource};
pub use ipmi::{IpmiConfig, IpmiRemote, IpmiSource};
pub use nvidia_smi::{NvidiaSmiConfig, NvidiaSmiSource};
pub use racadm::{RacadmConfig, RacadmSource};
pub use rapl::{RaplConfig, RaplSource};
pub use redfish::{RedfishConfig, RedfishSource};

#[cfg(feature = "nvml")]
pub use nvml::{NvmlConfig, NvmlSource};

use crate::error::{PowerError, Result};
use crate::metrics::data::Metadata;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::process::Command;

/// Default deadline for one external command invocation.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Read a sysfs attribute and trim the trailing newline.
pub(crate) fn read_trimmed(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Read a sysfs attribute holding one unsigned integer.
pub(crate) fn read_u64(path: &Path) -> Result<u64> {
    let value = read_trimmed(path)?;
    value.parse::<u64>().map_err(|e| {
        PowerError::parse_error(format!("{}: {:?} is not an integer: {}", path.display(), value, e))
    })
}

/// Subdirectories of `root`, sorted by name. Missing roots yield nothing.
pub(crate) fn sorted_subdirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    };
    dirs.sort();
    dirs
}

/// Run `program` with `args` and extra environment variables, returning stdout.
///
/// A non-zero exit status and a spawn failure are read errors for `backend`;
/// an expired deadline is a timeout.
pub(crate) async fn run_command(
    backend: &'static str,
    program: &Path,
    args: &[String],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().copied())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| PowerError::timeout(backend, timeout))?
        .map_err(|e| {
            PowerError::read_error(backend, format!("failed to run {}: {}", program.display(), e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PowerError::read_error(
            backend,
            format!("{} exited with {}: {}", program.display(), output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Host details shared by every backend's metadata.
pub(crate) fn host_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(hostname) = System::host_name() {
        metadata.insert("hostname".to_string(), hostname.into());
    }

    let system =
        System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
    if let Some(cpu) = system.cpus().first() {
        metadata.insert("cpu_model".to_string(), cpu.brand().trim().to_string().into());
    }
    metadata
}

/// Sum per-device power over a configured id set.
///
/// Configured ids missing from `reported` contribute nothing. Fails when none
/// of the configured ids was reported, since that is "no data", not zero power.
pub(crate) fn sum_selected(
    backend: &'static str,
    reported: impl IntoIterator<Item = (u32, f64)>,
    selected: &BTreeSet<u32>,
) -> Result<f64> {
    let mut total = 0.0;
    let mut matched = 0usize;

    for (id, watts) in reported {
        if selected.contains(&id) {
            total += watts;
            matched += 1;
        }
    }

    if matched == 0 {
        return Err(PowerError::read_error(
            backend,
            format!("none of the configured devices {:?} reported power", selected),
        ));
    }
    if matched < selected.len() {
        tracing::debug!(
            "{}: {} of {} configured devices reported power",
            backend,
            matched,
            selected.len()
        );
    }

    Ok(total)
}
