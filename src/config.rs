use crate::error::{WeError, WeResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// `H:M:S` wallclock budget (spec.md §6 `limits.max_wallclock`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wallclock(pub std::time::Duration);

impl<'de> Deserialize<'de> for Wallclock {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(serde::de::Error::custom(format!(
                "max_wallclock must be H:M:S, got {raw}"
            )));
        }
        let h: u64 = parts[0].parse().map_err(serde::de::Error::custom)?;
        let m: u64 = parts[1].parse().map_err(serde::de::Error::custom)?;
        let s: u64 = parts[2].parse().map_err(serde::de::Error::custom)?;
        Ok(Wallclock(std::time::Duration::from_secs(h * 3600 + m * 60 + s)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_iterations: u64,
    pub max_wallclock: Wallclock,
}

fn default_blocksize() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_blocksize")]
    pub blocksize: u32,
}

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeedConfig {
    #[serde(default = "default_false")]
    pub do_equilibrium_reweighting: bool,
    pub window_size: String,
    pub max_window_size: usize,
    pub reweight_period: u64,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub state: String,
}

/// One entry of `bins.source_pcoords`: a named recycling source with an
/// initial weight and a seed pcoord, keyed by bin name in the TOML table.
/// `init_weight` falls back to `weight` if absent, per
/// `default.py:103-106`'s `source.get('init_weight', source['weight'])`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcePcoordConfig {
    pub bin_id: usize,
    pub weight: f64,
    pub init_weight: Option<f64>,
    pub pcoord: Vec<f64>,
}

impl SourcePcoordConfig {
    pub fn effective_init_weight(&self) -> f64 {
        self.init_weight.unwrap_or(self.weight)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinsConfig {
    #[serde(rename = "type")]
    pub bin_type: String,
    #[serde(default)]
    pub source_pcoords: BTreeMap<String, SourcePcoordConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WemdConfig {
    pub initial_particles: Option<u32>,
    pub initial_pcoord: Option<Vec<f64>>,
}

/// Root configuration tree (spec.md §6). Mirrors the dotted-key layout
/// the spec names exactly, one nested struct per top-level table, parsed
/// with `toml` the way `core-config` parses its settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub limits: LimitsConfig,
    #[serde(default)]
    pub backend: Option<BackendConfig>,
    pub weed: Option<WeedConfig>,
    pub data: DataConfig,
    pub bins: BinsConfig,
    #[serde(default)]
    pub wemd: Option<WemdConfig>,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> WeResult<Self> {
        toml::from_str(raw).map_err(|e| WeError::ConfigError(format!("config parse failed: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> WeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| WeError::ConfigError(format!("reading {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn blocksize(&self) -> u32 {
        self.backend.as_ref().map(|b| b.blocksize).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [limits]
        max_iterations = 100
        max_wallclock = "24:00:00"

        [data]
        state = "we.state"

        [bins]
        type = "rectilinear"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.limits.max_iterations, 100);
        assert_eq!(cfg.limits.max_wallclock.0, std::time::Duration::from_secs(86400));
        assert_eq!(cfg.blocksize(), 1);
        assert!(cfg.weed.is_none());
    }

    #[test]
    fn malformed_wallclock_is_a_config_error() {
        let bad = MINIMAL.replace("24:00:00", "notatime");
        assert!(Config::from_toml_str(&bad).is_err());
    }

    #[test]
    fn weed_config_with_source_pcoords_parses() {
        let raw = r#"
            [limits]
            max_iterations = 10
            max_wallclock = "1:00:00"

            [backend]
            blocksize = 4

            [weed]
            do_equilibrium_reweighting = true
            window_size = "0.5"
            max_window_size = 50
            reweight_period = 1
            priority = 5

            [data]
            state = "/tmp/we.state"

            [bins]
            type = "rectilinear"

            [bins.source_pcoords.source_0]
            bin_id = 0
            weight = 1.0
            pcoord = [0.1]
        "#;
        let cfg = Config::from_toml_str(raw).unwrap();
        assert_eq!(cfg.blocksize(), 4);
        let weed = cfg.weed.unwrap();
        assert!(weed.do_equilibrium_reweighting);
        assert_eq!(weed.window_size, "0.5");
        let source = &cfg.bins.source_pcoords["source_0"];
        assert_eq!(source.effective_init_weight(), 1.0);
    }
}
