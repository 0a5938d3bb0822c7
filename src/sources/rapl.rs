//! Intel RAPL package energy counters via the powercap sysfs interface.
//!
//! Each zone directory (`intel-rapl:0`, `intel-rapl:0:0`, ...) carries a
//! `name`, a cumulative `energy_uj` counter and the `max_energy_range_uj`
//! value at which that counter wraps.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{host_metadata, read_trimmed, read_u64, sorted_subdirs};

const BACKEND: &str = "intel_rapl";
const ZONE_PREFIX: &str = "intel-rapl:";
const DEFAULT_DOMAIN: &str = "package-0";
/// Used when a zone does not expose `max_energy_range_uj`.
const FALLBACK_MAX_RANGE_UJ: u64 = 1 << 32;

/// Configuration for [`RaplSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaplConfig {
    /// Powercap control-type directory holding the `intel-rapl:N` zones
    pub root: PathBuf,
    /// Zone to sample, e.g. `package-0` or `package-0-dram`
    pub domain: Option<String>,
}

impl Default for RaplConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/class/powercap/intel-rapl"),
            domain: None,
        }
    }
}

impl RaplConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Cumulative package energy from one RAPL zone.
#[derive(Debug)]
pub struct RaplSource {
    domain: String,
    energy_path: PathBuf,
    max_range_joules: f64,
    metadata: Metadata,
}

impl RaplSource {
    /// Locate the configured zone and check its counter is readable.
    pub fn new(config: RaplConfig) -> Result<Self> {
        if !config.root.exists() {
            return Err(PowerError::unavailable(
                BACKEND,
                format!(
                    "{} not found; RAPL needs a supported CPU with the powercap driver loaded",
                    config.root.display()
                ),
            ));
        }

        let zones = discover_zones(&config.root);
        if zones.is_empty() {
            return Err(PowerError::unavailable(
                BACKEND,
                format!("no RAPL zones under {}", config.root.display()),
            ));
        }

        let (domain, zone_path) = select_zone(&zones, config.domain.as_deref())?;
        let energy_path = zone_path.join("energy_uj");
        read_u64(&energy_path).map_err(|e| {
            PowerError::unavailable(
                BACKEND,
                format!("cannot read {}: {}", energy_path.display(), e),
            )
        })?;

        let max_range_uj = read_u64(&zone_path.join("max_energy_range_uj")).unwrap_or_else(|e| {
            debug!("{}: no max_energy_range_uj ({}), assuming 2^32 uJ", BACKEND, e);
            FALLBACK_MAX_RANGE_UJ
        });
        let max_range_joules = max_range_uj as f64 / 1e6;

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert("domain".to_string(), domain.clone().into());
        metadata.insert(
            "energy_path".to_string(),
            energy_path.display().to_string().into(),
        );
        metadata.insert("max_energy_joules".to_string(), max_range_joules.into());

        info!(
            "Using RAPL domain {} ({}), counter wraps at {:.1} J",
            domain,
            zone_path.display(),
            max_range_joules
        );

        Ok(Self {
            domain,
            energy_path,
            max_range_joules,
            metadata,
        })
    }

    pub fn domain_name(&self) -> &str {
        &self.domain
    }
}

#[async_trait]
impl PowerSource for RaplSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::Cpu
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::CumulativeEnergy {
            max_range_joules: Some(self.max_range_joules),
        }
    }

    async fn read(&mut self) -> Result<f64> {
        let microjoules = read_u64(&self.energy_path)?;
        Ok(microjoules as f64 / 1e6)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

/// Map zone names to their directories.
///
/// Top-level zones keep their own name (`package-0`); sub-zones are prefixed
/// with their parent (`package-0-dram`). Unreadable zones are skipped.
pub fn discover_zones(root: &Path) -> BTreeMap<String, PathBuf> {
    let mut zones = BTreeMap::new();

    for zone in sorted_subdirs(root).into_iter().filter(|p| is_zone(p)) {
        let Ok(name) = read_trimmed(&zone.join("name")) else {
            continue;
        };

        for sub in sorted_subdirs(&zone).into_iter().filter(|p| is_zone(p)) {
            if let Ok(sub_name) = read_trimmed(&sub.join("name")) {
                zones.insert(format!("{}-{}", name, sub_name), sub);
            }
        }
        zones.insert(name, zone);
    }

    zones
}

fn is_zone(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(ZONE_PREFIX))
}

fn select_zone(
    zones: &BTreeMap<String, PathBuf>,
    requested: Option<&str>,
) -> Result<(String, PathBuf)> {
    let name = match requested {
        Some(name) if zones.contains_key(name) => name.to_string(),
        Some(name) => {
            let available: Vec<&str> = zones.keys().map(String::as_str).collect();
            return Err(PowerError::unavailable(
                BACKEND,
                format!("domain '{}' not found, available: {:?}", name, available),
            ));
        }
        None if zones.contains_key(DEFAULT_DOMAIN) => DEFAULT_DOMAIN.to_string(),
        // non-empty, checked by the caller
        None => zones.keys().next().cloned().unwrap_or_default(),
    };

    let path = zones[&name].clone();
    Ok((name, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_zone(dir: &Path, name: &str, energy: u64, max: Option<u64>) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("energy_uj"), format!("{}\n", energy)).unwrap();
        if let Some(max) = max {
            fs::write(dir.join("max_energy_range_uj"), format!("{}\n", max)).unwrap();
        }
    }

    fn fake_powercap() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let pkg0 = root.path().join("intel-rapl:0");
        write_zone(&pkg0, "package-0", 5_000_000, Some(262_143_328_850));
        write_zone(&pkg0.join("intel-rapl:0:0"), "dram", 1_000_000, None);
        write_zone(&root.path().join("intel-rapl:1"), "package-1", 7_000_000, Some(262_143_328_850));
        root
    }

    #[test]
    fn test_discover_zones() {
        let root = fake_powercap();
        let zones = discover_zones(root.path());
        let names: Vec<&str> = zones.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["package-0", "package-0-dram", "package-1"]);
    }

    #[tokio::test]
    async fn test_default_domain_reads_joules() {
        let root = fake_powercap();
        let mut source = RaplSource::new(RaplConfig::default().with_root(root.path())).unwrap();

        assert_eq!(source.domain_name(), "package-0");
        assert_eq!(source.read().await.unwrap(), 5.0);
        assert_eq!(
            source.semantics(),
            ReadSemantics::CumulativeEnergy {
                max_range_joules: Some(262_143.328_850)
            }
        );
        assert_eq!(source.metadata()["monitor_type"], "intel_rapl");
    }

    #[test]
    fn test_subzone_falls_back_to_default_range() {
        let root = fake_powercap();
        let config = RaplConfig::default()
            .with_root(root.path())
            .with_domain("package-0-dram");
        let source = RaplSource::new(config).unwrap();
        assert_eq!(source.max_range_joules, (1u64 << 32) as f64 / 1e6);
    }

    #[test]
    fn test_unknown_domain_fails() {
        let root = fake_powercap();
        let config = RaplConfig::default().with_root(root.path()).with_domain("psys");
        let err = RaplSource::new(config).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_missing_root_fails() {
        let root = tempfile::tempdir().unwrap();
        let config = RaplConfig::default().with_root(root.path().join("absent"));
        assert!(RaplSource::new(config).unwrap_err().is_unavailable());

        let empty = RaplConfig::default().with_root(root.path());
        assert!(RaplSource::new(empty).unwrap_err().is_unavailable());
    }
}
