use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{KernelError, KernelResult};

/// Which kind of worker runs a vat when its options do not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagerType {
    #[default]
    Local,
    XsWorker,
    NodeSubprocess,
}

impl ManagerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagerType::Local => "local",
            ManagerType::XsWorker => "xs-worker",
            ManagerType::NodeSubprocess => "node-subprocess",
        }
    }
}

impl FromStr for ManagerType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ManagerType::Local),
            "xs-worker" => Ok(ManagerType::XsWorker),
            "node-subprocess" => Ok(ManagerType::NodeSubprocess),
            other => Err(KernelError::InvalidConfig(format!(
                "unknown manager type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ManagerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many deliveries a vat receives between `bringOutYourDead` reaps.
/// Serialized as a number or the string `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawReapInterval", into = "RawReapInterval")]
pub enum ReapInterval {
    Every(u64),
    Never,
}

impl Default for ReapInterval {
    fn default() -> Self {
        ReapInterval::Every(1)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawReapInterval {
    Count(u64),
    Word(String),
}

impl TryFrom<RawReapInterval> for ReapInterval {
    type Error = String;

    fn try_from(raw: RawReapInterval) -> Result<Self, Self::Error> {
        match raw {
            RawReapInterval::Count(n) => Ok(ReapInterval::Every(n)),
            RawReapInterval::Word(word) if word == "never" => Ok(ReapInterval::Never),
            RawReapInterval::Word(word) => Err(format!("invalid reap interval '{word}'")),
        }
    }
}

impl From<ReapInterval> for RawReapInterval {
    fn from(value: ReapInterval) -> Self {
        match value {
            ReapInterval::Every(n) => RawReapInterval::Count(n),
            ReapInterval::Never => RawReapInterval::Word("never".into()),
        }
    }
}

impl FromStr for ReapInterval {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "never" {
            return Ok(ReapInterval::Never);
        }
        s.parse()
            .map(ReapInterval::Every)
            .map_err(|_| KernelError::InvalidConfig(format!("invalid reap interval '{s}'")))
    }
}

impl fmt::Display for ReapInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapInterval::Every(n) => write!(f, "{n}"),
            ReapInterval::Never => f.write_str("never"),
        }
    }
}

fn default_snapshot_initial() -> u64 {
    3
}

fn default_snapshot_interval() -> u64 {
    200
}

/// Boot-time kernel settings, recorded under `kernel.*` by
/// [`KernelKeeper::create_starting_kernel_state`](crate::KernelKeeper::create_starting_kernel_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(default)]
    pub default_manager_type: ManagerType,
    #[serde(default)]
    pub default_reap_interval: ReapInterval,
    /// Deliveries before a vat's first heap snapshot.
    #[serde(default = "default_snapshot_initial")]
    pub snapshot_initial: u64,
    /// Deliveries between later snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_manager_type: ManagerType::default(),
            default_reap_interval: ReapInterval::default(),
            snapshot_initial: default_snapshot_initial(),
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

impl KernelConfig {
    pub fn from_json(text: &str) -> KernelResult<Self> {
        let config: KernelConfig = serde_json::from_str(text)
            .map_err(|err| KernelError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.default_reap_interval == ReapInterval::Every(0) {
            return Err(KernelError::InvalidConfig(
                "defaultReapInterval must be positive or 'never'".into(),
            ));
        }
        if self.snapshot_initial == 0 {
            return Err(KernelError::InvalidConfig(
                "snapshotInitial must be positive".into(),
            ));
        }
        if self.snapshot_interval == 0 {
            return Err(KernelError::InvalidConfig(
                "snapshotInterval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = KernelConfig::from_json(r#"{"defaultManagerType":"xs-worker"}"#).unwrap();
        assert_eq!(config.default_manager_type, ManagerType::XsWorker);
        assert_eq!(config.default_reap_interval, ReapInterval::Every(1));
        assert_eq!(config.snapshot_initial, 3);
        assert_eq!(config.snapshot_interval, 200);
    }

    #[test]
    fn reap_interval_accepts_never() {
        let config = KernelConfig::from_json(r#"{"defaultReapInterval":"never"}"#).unwrap();
        assert_eq!(config.default_reap_interval, ReapInterval::Never);
        assert_eq!(
            serde_json::to_string(&ReapInterval::Never).unwrap(),
            r#""never""#
        );
        assert_eq!(serde_json::to_string(&ReapInterval::Every(5)).unwrap(), "5");
        assert_eq!("never".parse::<ReapInterval>().unwrap(), ReapInterval::Never);
        assert!("sometimes".parse::<ReapInterval>().is_err());
    }

    #[test]
    fn rejects_bad_configs() {
        for text in [
            r#"{"defaultManagerType":"wasm"}"#,
            r#"{"defaultReapInterval":"sometimes"}"#,
            r#"{"defaultReapInterval":0}"#,
            r#"{"snapshotInterval":0}"#,
            r#"{"mystery":true}"#,
        ] {
            assert!(
                matches!(KernelConfig::from_json(text), Err(KernelError::InvalidConfig(_))),
                "{text}"
            );
        }
    }
}
