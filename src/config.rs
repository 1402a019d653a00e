use crate::module::{FirmwareSet, ModuleOptions};
use crate::transport::DEFAULT_PORT;
use crate::{PslError, PslResult};
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub timeouts: Timeouts,
    #[config(nested)]
    pub logging: Logging,
    #[config(default = [])]
    pub firmware_sets: Vec<FirmwareSetConf>,
    pub modules: Vec<ModuleConf>,
    #[config(default = [])]
    pub detector_values: Vec<DetectorValues>,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Seconds; 0 runs until quit.
    #[config(default = 0)]
    pub run_duration: u64,
    #[config(default = 200)]
    pub poll_interval_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct Timeouts {
    #[config(default = 2000)]
    pub response_ms: u64,
    #[config(default = 10000)]
    pub adc_trace_ms: u64,
    #[config(default = 5000)]
    pub state_change_ms: u64,
    #[config(default = 30000)]
    pub characterization_ms: u64,
    #[config(default = 5000)]
    pub connect_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct Logging {
    #[config(default = "info")]
    pub level: String,
    #[config(default = "falconx.log")]
    pub file: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FirmwareSetConf {
    pub alias: String,
    pub filename: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModuleConf {
    pub alias: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// One firmware-set alias per channel; empty strings leave a channel unbound.
    #[serde(default)]
    pub firmware_sets: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_channels() -> usize {
    1
}

#[derive(Deserialize, Debug, Clone)]
pub struct DetectorValues {
    /// Module alias; the first module when omitted.
    #[serde(default)]
    pub module: Option<String>,
    pub channel: usize,
    pub values: HashMap<String, f64>,
}

impl Conf {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Ok(Conf::builder().file(path).load()?)
    }

    pub fn module(&self, alias: &str) -> PslResult<&ModuleConf> {
        self.modules
            .iter()
            .find(|m| m.alias == alias)
            .ok_or(PslError::NotFound)
    }

    /// Resolves the module's firmware-set aliases and the timeouts into
    /// [`ModuleOptions`].
    pub fn module_options(&self, module: &ModuleConf) -> PslResult<ModuleOptions> {
        let mut firmware_sets = Vec::with_capacity(module.channels);
        for alias in &module.firmware_sets {
            if alias.is_empty() {
                firmware_sets.push(None);
                continue;
            }
            let set = self
                .firmware_sets
                .iter()
                .find(|fs| &fs.alias == alias)
                .ok_or(PslError::NotFound)?;
            firmware_sets.push(Some(FirmwareSet {
                alias: set.alias.clone(),
                filename: set.filename.clone(),
            }));
        }
        let t = &self.timeouts;
        Ok(ModuleOptions {
            alias: module.alias.clone(),
            channels: module.channels,
            response_timeout: Duration::from_millis(t.response_ms),
            adc_trace_timeout: Duration::from_millis(t.adc_trace_ms),
            state_change_timeout: Duration::from_millis(t.state_change_ms),
            characterization_timeout: Duration::from_millis(t.characterization_ms),
            connect_timeout: Duration::from_millis(t.connect_ms),
            firmware_sets,
        })
    }

    /// Acquisition values configured for one module, as (channel, name, value).
    pub fn values_for(&self, alias: &str) -> Vec<(usize, String, f64)> {
        let first = self.modules.first().map(|m| m.alias.as_str());
        let mut values: Vec<(usize, String, f64)> = self
            .detector_values
            .iter()
            .filter(|d| d.module.as_deref().or(first) == Some(alias))
            .flat_map(|d| {
                d.values
                    .iter()
                    .map(move |(name, value)| (d.channel, name.clone(), *value))
            })
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[run_settings]
run_duration = 60

[timeouts]
response_ms = 1500

[logging]
level = "debug"

[[firmware_sets]]
alias = "fs0"
filename = "detector0.cal"

[[modules]]
alias = "module1"
host = "192.168.1.3"
channels = 2
firmware_sets = ["fs0", ""]

[[detector_values]]
channel = 1
values = { mapping_mode = 1.0, num_map_pixels_per_buffer = 16.0 }
"#;

    fn load_sample() -> Conf {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        Conf::load(file.path()).unwrap()
    }

    #[test]
    fn defaults_and_overrides() {
        let conf = load_sample();
        assert_eq!(conf.run_settings.run_duration, 60);
        assert_eq!(conf.run_settings.poll_interval_ms, 200);
        assert_eq!(conf.timeouts.response_ms, 1500);
        assert_eq!(conf.timeouts.adc_trace_ms, 10000);
        assert_eq!(conf.logging.level, "debug");
        assert_eq!(conf.modules[0].port, DEFAULT_PORT);
    }

    #[test]
    fn module_options_resolve_firmware_sets() {
        let conf = load_sample();
        let module = conf.module("module1").unwrap();
        let options = conf.module_options(module).unwrap();
        assert_eq!(options.channels, 2);
        assert_eq!(options.response_timeout, Duration::from_millis(1500));
        assert_eq!(
            options.firmware_sets[0].as_ref().unwrap().filename,
            PathBuf::from("detector0.cal")
        );
        assert!(options.firmware_sets[1].is_none());
        assert_eq!(conf.module("module2").unwrap_err(), PslError::NotFound);
    }

    #[test]
    fn detector_values_default_to_first_module() {
        let conf = load_sample();
        let values = conf.values_for("module1");
        assert_eq!(
            values,
            vec![
                (1, "mapping_mode".to_string(), 1.0),
                (1, "num_map_pixels_per_buffer".to_string(), 16.0)
            ]
        );
        assert!(conf.values_for("other").is_empty());
    }
}
