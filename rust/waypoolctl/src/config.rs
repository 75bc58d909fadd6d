// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! TOML configuration: where resctrl lives, the reserved OS/Infra regions,
//! the elastic pool sizes, named request policies, and the store/lock paths.
//! Every section has a usable default; records are validated at load time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use waypool_utils::Bitmask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub resctrl: ResctrlSection,
    pub os: OsSection,
    pub infra: InfraSection,
    pub pools: PoolsSection,
    pub policies: BTreeMap<String, Policy>,
    pub store: StoreSection,
    pub lock: LockSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResctrlSection {
    /// Explicit mount point; discovered from `/proc/mounts` when absent.
    pub mount: Option<PathBuf>,
    /// Cache level way allocation operates on.
    pub level: String,
    /// Bandwidth values are MBps, not percent. Only consulted together with
    /// an explicit `mount`; discovery reads it off the mount options.
    pub mba_mbps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsSection {
    /// Ways reserved for the OS region on caches serving the OS CPUs.
    pub cache_ways: u32,
    /// Core-range text, e.g. `"0-1"`.
    pub cpus: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraSection {
    pub cpus: String,
    /// Process ids pinned into the infra group by `setup`.
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsSection {
    pub guarantee: u32,
    pub besteffort: u32,
    pub shared: u32,
    /// Allow reclaiming ways from best-effort siblings under pressure.
    pub shrink: bool,
    /// Maximum concurrently admitted shared-pool workloads.
    pub shared_quota: u32,
    /// Group name all shared-pool workloads land in.
    pub shared_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub max_ways: u32,
    pub min_ways: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            resctrl: ResctrlSection::default(),
            os: OsSection::default(),
            infra: InfraSection::default(),
            pools: PoolsSection::default(),
            policies: default_policies(),
            store: StoreSection::default(),
            lock: LockSection::default(),
        }
    }
}

impl Default for ResctrlSection {
    fn default() -> ResctrlSection {
        ResctrlSection {
            mount: None,
            level: "L3".to_string(),
            mba_mbps: false,
        }
    }
}

impl Default for OsSection {
    fn default() -> OsSection {
        OsSection {
            cache_ways: 1,
            cpus: "0".to_string(),
        }
    }
}

impl Default for PoolsSection {
    fn default() -> PoolsSection {
        PoolsSection {
            guarantee: 4,
            besteffort: 3,
            shared: 2,
            shrink: false,
            shared_quota: 10,
            shared_group: "shared".to_string(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> StoreSection {
        StoreSection {
            path: PathBuf::from("/var/lib/waypool/workloads.json"),
        }
    }
}

impl Default for LockSection {
    fn default() -> LockSection {
        LockSection {
            path: PathBuf::from("/var/run/waypool.lock"),
        }
    }
}

fn default_policies() -> BTreeMap<String, Policy> {
    BTreeMap::from([
        (
            "gold".to_string(),
            Policy {
                max_ways: 4,
                min_ways: 4,
            },
        ),
        (
            "silver".to_string(),
            Policy {
                max_ways: 4,
                min_ways: 2,
            },
        ),
        (
            "bronze".to_string(),
            Policy {
                max_ways: 0,
                min_ways: 0,
            },
        ),
    ])
}

impl Config {
    /// Load configuration: from an explicit path, else from the first system
    /// config found, else the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config = match path {
            Some(path) => parse_config_file(path)?,
            None => match get_config_path() {
                Some(found) => parse_config_file(&found)?,
                None => Config::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn os_cpus(&self, nr_cpus: usize) -> Result<Bitmask> {
        cpus_from_text(&self.os.cpus, nr_cpus).context("Failed to parse [os] cpus")
    }

    pub fn infra_cpus(&self, nr_cpus: usize) -> Result<Bitmask> {
        cpus_from_text(&self.infra.cpus, nr_cpus).context("Failed to parse [infra] cpus")
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        for (section, text) in [("os", &self.os.cpus), ("infra", &self.infra.cpus)] {
            if !text.is_empty() {
                Bitmask::from_spec(None, text)
                    .with_context(|| format!("Failed to parse [{section}] cpus {text:?}"))?;
            }
        }
        if self.pools.guarantee == 0 && self.pools.besteffort == 0 && self.pools.shared == 0 {
            bail!("no pool has any ways configured");
        }
        if self.pools.shared > 0 && self.pools.shared_group.is_empty() {
            bail!("[pools] shared_group must be named when the shared pool has ways");
        }
        for (name, policy) in &self.policies {
            if policy.max_ways < policy.min_ways {
                bail!(
                    "policy {:?}: max_ways {} is less than min_ways {}",
                    name,
                    policy.max_ways,
                    policy.min_ways
                );
            }
        }
        Ok(())
    }
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let file_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    parse_config_content(&file_content)
}

fn get_config_path() -> Option<PathBuf> {
    let check_paths = ["/etc/waypool/config.toml", "/etc/waypool.toml"];
    check_paths
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn parse_config_content(file_content: &str) -> Result<Config> {
    if file_content.is_empty() {
        bail!("The config file is empty!")
    }
    let config: Config = toml::from_str(file_content)?;
    Ok(config)
}

fn cpus_from_text(text: &str, nr_cpus: usize) -> Result<Bitmask> {
    if text.is_empty() {
        return Ok(Bitmask::new(nr_cpus));
    }
    Bitmask::from_spec(Some(nr_cpus), text)
}

#[cfg(test)]
mod tests {
    use crate::config::*;

    #[test]
    fn test_full_config() {
        let config_str = r#"
[resctrl]
mount = "/sys/fs/resctrl"
level = "L2"

[os]
cache_ways = 1
cpus = "0-1"

[infra]
cpus = "2"
tasks = ["4242"]

[pools]
guarantee = 4
besteffort = 3
shared = 2
shrink = true
shared_quota = 5
shared_group = "shared"

[policies.gold]
max_ways = 6
min_ways = 6

[policies.bronze]
max_ways = 0
min_ways = 0

[store]
path = "/tmp/waypool/workloads.json"

[lock]
path = "/tmp/waypool.lock"
"#;

        let config = parse_config_content(config_str).expect("Failed to parse config");
        config.validate().expect("Failed to validate config");
        assert_eq!(config.resctrl.mount, Some(PathBuf::from("/sys/fs/resctrl")));
        assert_eq!(config.resctrl.level, "L2");
        assert_eq!(config.os.cache_ways, 1);
        assert_eq!(config.infra.tasks, vec!["4242"]);
        assert!(config.pools.shrink);
        assert_eq!(config.pools.shared_quota, 5);
        assert_eq!(
            config.policy("gold"),
            Some(&Policy {
                max_ways: 6,
                min_ways: 6
            })
        );
        // An explicit policies table replaces the built-in set.
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.store.path, PathBuf::from("/tmp/waypool/workloads.json"));
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let config_str = r#"
[pools]
guarantee = 8
"#;
        let config = parse_config_content(config_str).expect("Failed to parse config");
        config.validate().expect("Failed to validate config");
        assert_eq!(config.resctrl.level, "L3");
        assert_eq!(config.resctrl.mount, None);
        assert_eq!(config.os.cache_ways, 1);
        assert_eq!(config.os.cpus, "0");
        // Partial [pools] keeps the other defaults.
        assert_eq!(config.pools.guarantee, 8);
        assert_eq!(config.pools.besteffort, 3);
        assert_eq!(config.pools.shared_group, "shared");
        assert!(config.policies.contains_key("gold"));
        assert!(config.policies.contains_key("silver"));
        assert!(config.policies.contains_key("bronze"));
    }

    #[test]
    fn test_default_config_validates() {
        Config::default().validate().expect("Failed to validate");
    }

    #[test]
    fn test_empty_config_is_error() {
        assert!(parse_config_content("").is_err());
    }

    #[test]
    fn test_backward_policy_rejected() {
        let config_str = r#"
[policies.broken]
max_ways = 2
min_ways = 4
"#;
        let config = parse_config_content(config_str).expect("Failed to parse config");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_cpus_rejected() {
        let config_str = r#"
[os]
cpus = "zz"
"#;
        let config = parse_config_content(config_str).expect("Failed to parse config");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_pools_zero_rejected() {
        let config_str = r#"
[pools]
guarantee = 0
besteffort = 0
shared = 0
"#;
        let config = parse_config_content(config_str).expect("Failed to parse config");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_os_cpus_parse() {
        let config = Config::default();
        assert_eq!(config.os_cpus(8).unwrap().to_human_string(), "0");
        assert!(config.infra_cpus(8).unwrap().is_empty());
    }
}
