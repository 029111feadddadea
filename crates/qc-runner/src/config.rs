use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;

pub const QCMANAGER_STORE_ENV: &str = "QCMANAGER_STORE";
pub const QCMANAGER_PROGRESS_EVERY_ENV: &str = "QCMANAGER_PROGRESS_EVERY";

pub const DEFAULT_STORE_ROOT: &str = "results";
pub const DEFAULT_PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Parent of the per-board session directories.
    pub store_root: PathBuf,
    /// Headless progress is logged once every this many iteration steps.
    pub progress_every: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| match env::var(name) {
            Ok(raw) => Ok(Some(raw)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
        })
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(QCMANAGER_STORE_ENV)? {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                config.store_root = PathBuf::from(trimmed);
            }
        }
        if let Some(every) =
            parse_optional_positive_usize(QCMANAGER_PROGRESS_EVERY_ENV, lookup(QCMANAGER_PROGRESS_EVERY_ENV)?)?
        {
            config.progress_every = every;
        }
        Ok(config)
    }

    pub fn with_store_root(mut self, store_root: impl Into<PathBuf>) -> Self {
        self.store_root = store_root.into();
        self
    }
}

fn parse_optional_positive_usize(name: &str, raw: Option<String>) -> Result<Option<usize>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed.parse::<usize>().map_err(|_| {
        anyhow!(
            "{} must be a positive integer when set (got: {})",
            name,
            raw
        )
    })?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0 when set", name));
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        pairs: &[(&str, &str)],
    ) -> impl Fn(&str) -> Result<Option<String>> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| Ok(map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let config = RunnerConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config, RunnerConfig::default());

        let config = RunnerConfig::from_lookup(lookup_from(&[
            (QCMANAGER_STORE_ENV, "  "),
            (QCMANAGER_PROGRESS_EVERY_ENV, ""),
        ]))
        .expect("blank");
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn env_values_override_defaults() {
        let config = RunnerConfig::from_lookup(lookup_from(&[
            (QCMANAGER_STORE_ENV, "/data/qc"),
            (QCMANAGER_PROGRESS_EVERY_ENV, "25"),
        ]))
        .expect("values");
        assert_eq!(config.store_root, PathBuf::from("/data/qc"));
        assert_eq!(config.progress_every, 25);
        assert_eq!(
            config.with_store_root("elsewhere").store_root,
            PathBuf::from("elsewhere")
        );
    }

    #[test]
    fn invalid_progress_stride_is_rejected() {
        let err = RunnerConfig::from_lookup(lookup_from(&[(QCMANAGER_PROGRESS_EVERY_ENV, "abc")]))
            .expect_err("not a number");
        assert!(
            err.to_string()
                .contains("QCMANAGER_PROGRESS_EVERY must be a positive integer"),
            "{}",
            err
        );
        let err = RunnerConfig::from_lookup(lookup_from(&[(QCMANAGER_PROGRESS_EVERY_ENV, "0")]))
            .expect_err("zero");
        assert!(err.to_string().contains("must be > 0"), "{}", err);
    }
}
