//! Behavioral contract for the tileboard test-rig controller.
//!
//! The rig exposes three logical endpoints (fast DAQ control, the data pull
//! server, and slow control), each carrying its own nested key-value
//! configuration document. Procedures only see [`TileboardController`]; the
//! request/response transport lives behind implementations of it.

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Daq,
    Pull,
    SlowControl,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Daq, Endpoint::Pull, Endpoint::SlowControl];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daq => "daq",
            Self::Pull => "pull",
            Self::SlowControl => "slow_control",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigMergeError {
    #[error("mismatched structure at [{0}]")]
    StructureMismatch(String),
    #[error("configuration documents must be mappings")]
    NotAMapping,
}

pub trait TileboardController: Send {
    fn config(&self, endpoint: Endpoint) -> &Value;

    fn config_mut(&mut self, endpoint: Endpoint) -> &mut Value;

    /// Push configuration to the endpoint. With `update`, the fragment is
    /// merged into the stored document first and only the fragment is sent.
    fn configure(&mut self, endpoint: Endpoint, update: Option<&Value>) -> Result<()>;

    fn start(&mut self, endpoint: Endpoint) -> Result<()>;

    fn is_complete(&mut self, endpoint: Endpoint) -> Result<bool>;

    fn stop(&mut self, endpoint: Endpoint) -> Result<()>;

    /// Move the data file produced by the last acquisition to `dest`.
    fn collect_output(&mut self, dest: &Path) -> Result<()>;

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deep-merge `update` into `dest` in place.
pub fn merge_nested(dest: &mut Value, update: &Value) -> Result<(), ConfigMergeError> {
    let (Some(dest_map), Some(update_map)) = (dest.as_object_mut(), update.as_object()) else {
        return Err(ConfigMergeError::NotAMapping);
    };
    merge_maps(dest_map, update_map, &mut Vec::new())
}

fn merge_maps(
    dest: &mut Map<String, Value>,
    update: &Map<String, Value>,
    path: &mut Vec<String>,
) -> Result<(), ConfigMergeError> {
    for (key, up) in update {
        path.push(key.clone());
        match dest.get_mut(key) {
            Some(existing) => match (existing.as_object_mut(), up.as_object()) {
                (Some(dest_child), Some(up_child)) => merge_maps(dest_child, up_child, path)?,
                (None, None) => *existing = up.clone(),
                _ => return Err(ConfigMergeError::StructureMismatch(path.join("."))),
            },
            None => {
                dest.insert(key.clone(), up.clone());
            }
        }
        path.pop();
    }
    Ok(())
}

/// `create_nested(&["a", "b"], v)` builds `{"a": {"b": v}}`.
pub fn create_nested(keys: &[&str], value: Value) -> Value {
    keys.iter().rev().fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.to_string(), inner);
        Value::Object(map)
    })
}

pub fn load_config_file(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read controller config {}: {}", path.display(), e))?;
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|e| anyhow!("invalid controller config {}: {}", path.display(), e))?;
    if !value.is_object() {
        return Err(anyhow!(
            "controller config {} must be a mapping",
            path.display()
        ));
    }
    Ok(value)
}

/// In-memory rig used for headless dry runs and tests.
#[derive(Debug)]
pub struct SimulatedController {
    configs: BTreeMap<Endpoint, Value>,
    running: BTreeMap<Endpoint, bool>,
    polls_until_complete: usize,
    polls: usize,
    acquisitions: usize,
    calls: Vec<String>,
}

impl SimulatedController {
    pub fn new(base_config: Value) -> Self {
        let configs = Endpoint::ALL
            .iter()
            .map(|e| (*e, base_config.clone()))
            .collect();
        Self {
            configs,
            running: BTreeMap::new(),
            polls_until_complete: 3,
            polls: 0,
            acquisitions: 0,
            calls: Vec::new(),
        }
    }

    pub fn from_config_file(path: &Path) -> Result<Self> {
        Ok(Self::new(load_config_file(path)?))
    }

    pub fn default_config() -> Value {
        json!({
            "daq": { "NEvents": "1000", "l1a_enables": {} },
            "global": { "outputDirectory": "/tmp", "run_type": "default", "serverIP": "localhost" },
            "roc_s0": { "sc": { "ch": {} } }
        })
    }

    pub fn with_polls_until_complete(mut self, polls: usize) -> Self {
        self.polls_until_complete = polls;
        self
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    fn record(&mut self, call: String) {
        tracing::debug!(call = %call, "simulated controller");
        self.calls.push(call);
    }

    fn configured_events(&self) -> u64 {
        self.configs
            .get(&Endpoint::Daq)
            .and_then(|c| c.get("daq"))
            .and_then(|d| d.get("NEvents"))
            .and_then(|n| match n {
                Value::String(s) => s.parse().ok(),
                other => other.as_u64(),
            })
            .unwrap_or(0)
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new(Self::default_config())
    }
}

impl TileboardController for SimulatedController {
    fn config(&self, endpoint: Endpoint) -> &Value {
        &self.configs[&endpoint]
    }

    fn config_mut(&mut self, endpoint: Endpoint) -> &mut Value {
        self.configs.entry(endpoint).or_insert_with(|| json!({}))
    }

    fn configure(&mut self, endpoint: Endpoint, update: Option<&Value>) -> Result<()> {
        if let Some(update) = update {
            merge_nested(self.config_mut(endpoint), update)?;
        }
        self.record(format!("configure:{}", endpoint.as_str()));
        Ok(())
    }

    fn start(&mut self, endpoint: Endpoint) -> Result<()> {
        self.running.insert(endpoint, true);
        if endpoint == Endpoint::Daq {
            self.polls = 0;
        }
        self.record(format!("start:{}", endpoint.as_str()));
        Ok(())
    }

    fn is_complete(&mut self, endpoint: Endpoint) -> Result<bool> {
        if !self.running.get(&endpoint).copied().unwrap_or(false) {
            return Err(anyhow!("{} endpoint is not running", endpoint.as_str()));
        }
        self.polls += 1;
        Ok(self.polls >= self.polls_until_complete)
    }

    fn stop(&mut self, endpoint: Endpoint) -> Result<()> {
        self.running.insert(endpoint, false);
        self.record(format!("stop:{}", endpoint.as_str()));
        Ok(())
    }

    fn collect_output(&mut self, dest: &Path) -> Result<()> {
        self.acquisitions += 1;
        let payload = json!({
            "acquisition": self.acquisitions,
            "n_events": self.configured_events(),
            "run_type": self.configs[&Endpoint::Pull]["global"]["run_type"].clone(),
        });
        fs::write(dest, serde_json::to_vec_pretty(&payload)?)?;
        self.record(format!("collect:{}", dest.display()));
        Ok(())
    }

    fn sleep(&self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_nested_updates_leaves_and_adds_keys() {
        let mut dest = json!({"roc": {"ch": {"0": {"Dacb": 10}}, "mode": "a"}});
        merge_nested(
            &mut dest,
            &json!({"roc": {"ch": {"0": {"Dacb": 12}, "1": {"Dacb": 3}}}, "extra": 1}),
        )
        .expect("compatible structure");
        assert_eq!(
            dest,
            json!({"roc": {"ch": {"0": {"Dacb": 12}, "1": {"Dacb": 3}}, "mode": "a"}, "extra": 1})
        );
    }

    #[test]
    fn merge_nested_reports_mismatch_path() {
        let mut dest = json!({"daq": {"NEvents": "10"}});
        let err = merge_nested(&mut dest, &json!({"daq": {"NEvents": {"x": 1}}}))
            .expect_err("scalar vs mapping");
        assert_eq!(err, ConfigMergeError::StructureMismatch("daq.NEvents".to_string()));
        assert_eq!(
            merge_nested(&mut json!(1), &json!({})),
            Err(ConfigMergeError::NotAMapping)
        );
    }

    #[test]
    fn create_nested_builds_single_path() {
        assert_eq!(
            create_nested(&["roc_s0", "sc", "ch"], json!(5)),
            json!({"roc_s0": {"sc": {"ch": 5}}})
        );
        assert_eq!(create_nested(&[], json!(5)), json!(5));
    }

    #[test]
    fn simulated_controller_completes_after_polls() {
        let mut ctl = SimulatedController::default().with_polls_until_complete(2);
        assert!(ctl.is_complete(Endpoint::Daq).is_err(), "not started");
        ctl.configure(Endpoint::Daq, Some(&json!({"daq": {"NEvents": "42"}})))
            .expect("configure");
        ctl.start(Endpoint::Daq).expect("start");
        assert!(!ctl.is_complete(Endpoint::Daq).expect("poll"));
        assert!(ctl.is_complete(Endpoint::Daq).expect("poll"));
        ctl.stop(Endpoint::Daq).expect("stop");
        assert_eq!(ctl.configured_events(), 42);
        assert_eq!(ctl.calls(), &["configure:daq", "start:daq", "stop:daq"]);
    }
}
