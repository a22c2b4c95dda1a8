use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::target::with_default_port;
use crate::{Chap, Target};

/// Fixed polling budget: `count` extra probes, `delay_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(count: u32, delay: Duration) -> Self {
        RetryPolicy {
            count,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Waiting for a by-path link to appear.
    pub fn device_default() -> Self {
        RetryPolicy::new(30, Duration::from_millis(1000))
    }

    /// Waiting for multipath to assemble its device-mapper node.
    pub fn dm_default() -> Self {
        RetryPolicy::new(30, Duration::from_millis(100))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiOptions {
    /// Bound on each login and logout command, 0 leaves them unbounded.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub force_mpio: bool,
    #[serde(default = "RetryPolicy::device_default")]
    pub device_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::dm_default")]
    pub dm_retry: RetryPolicy,
}

impl Default for IscsiOptions {
    fn default() -> Self {
        IscsiOptions {
            timeout_ms: 0,
            force_mpio: false,
            device_retry: RetryPolicy::device_default(),
            dm_retry: RetryPolicy::dm_default(),
        }
    }
}

impl IscsiOptions {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms > 0 {
            Some(Duration::from_millis(self.timeout_ms))
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    options: IscsiOptions,
    #[serde(default)]
    targets: Vec<TargetCfg>,
}

impl Config {
    pub fn new(options: IscsiOptions, targets: &[Target]) -> Self {
        Config {
            options,
            targets: targets.iter().map(TargetCfg::from).collect(),
        }
    }

    /// create `Config` from yaml string
    pub fn from(s: &str) -> Result<Config> {
        let config = serde_yml::from_str::<Config>(s)?;
        Ok(config)
    }

    /// create `Config` from yaml file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<Config> {
        let s = fs::read_to_string(filename)?;
        Config::from(&s)
    }

    /// encodes `Config` to yaml string
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    /// echo `Config` yaml string to the file
    pub fn write_to<S: AsRef<Path>>(&self, filename: S) -> Result<()> {
        let yml = self.to_yml()?;
        fs::write(filename, yml)?;

        Ok(())
    }

    pub fn options(&self) -> &IscsiOptions {
        &self.options
    }

    /// Targets with the default port filled in where a portal has none.
    pub fn targets(&self) -> Vec<Target> {
        self.targets.iter().map(Target::from).collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TargetCfg {
    #[serde(default)]
    portal: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    lun: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chap: Option<ChapCfg>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChapCfg {
    user: String,
    passwd: String,
}

impl From<&Target> for TargetCfg {
    fn from(value: &Target) -> Self {
        TargetCfg {
            portal: value.portal().to_string(),
            name: value.name().to_string(),
            lun: value.lun(),
            chap: value.chap().map(|chap| ChapCfg {
                user: chap.user().to_string(),
                passwd: chap.passwd().to_string(),
            }),
        }
    }
}

impl From<&TargetCfg> for Target {
    fn from(value: &TargetCfg) -> Self {
        let target = Target::new(
            with_default_port(&value.portal),
            value.name.trim().to_string(),
            value.lun,
        );
        match &value.chap {
            Some(chap) => target.with_chap(Chap::new(&chap.user, &chap.passwd)),
            None => target,
        }
    }
}
