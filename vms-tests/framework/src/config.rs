// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness configuration: which hosts to probe, how to log into guests and
//! hosts, and which platform and control-plane versions are deployed.

use std::{fmt, str::FromStr, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{platform::Platform, wait::Poller};

/// The default bound on any single wait for an asynchronous state change.
pub const DEFAULT_OPS_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("invalid vms version '{0}', expected <major>.<minor>")]
    BadVersion(String),
}

/// The username and private key used to reach a class of machines over SSH.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub key_path: Utf8PathBuf,
}

/// The version of the VMS control plane installed on the hypervisor hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmsVersion {
    pub major: u32,
    pub minor: u32,
}

impl VmsVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The exit code `vmsctl set` (and the other set-style subcommands)
    /// returns on success. Releases up to and including 2.3 report success
    /// with 1.
    pub fn set_success_code(&self) -> i32 {
        if *self <= Self::new(2, 3) {
            1
        } else {
            0
        }
    }
}

impl FromStr for VmsVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadVersion(s.to_owned());
        let (major, minor) = s.trim().split_once('.').ok_or_else(bad)?;
        Ok(Self {
            major: major.parse().map_err(|_| bad())?,
            minor: minor.parse().map_err(|_| bad())?,
        })
    }
}

impl TryFrom<String> for VmsVersion {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VmsVersion> for String {
    fn from(value: VmsVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VmsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn default_ops_timeout_secs() -> u64 {
    DEFAULT_OPS_TIMEOUT_SECS
}

/// Top-level harness configuration, usually read from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Which generation of the compute platform is deployed.
    pub platform: Platform,

    /// The control plane version on the hypervisor hosts.
    pub vms_version: VmsVersion,

    /// The hypervisor hosts that may be running test VMs, in the order they
    /// are probed when locating a VM.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Upper bound, in seconds, on every wait for an asynchronous transition.
    #[serde(default = "default_ops_timeout_secs")]
    pub ops_timeout_secs: u64,

    /// Credentials for logging into guests.
    pub guest: Credentials,

    /// Credentials for logging into hypervisor hosts.
    pub host: Credentials,
}

impl HarnessConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read { path: path.to_owned(), source }
        })?;
        Self::from_toml(&raw)
    }

    pub fn ops_timeout(&self) -> Duration {
        Duration::from_secs(self.ops_timeout_secs)
    }

    /// Builds a poller bounded by this configuration's operation timeout.
    pub fn poller(&self) -> Poller {
        Poller::new(self.ops_timeout())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_raw_toml() {
        let raw = r#"
            platform = "modern"
            vms_version = "2.4"
            hosts = ["node-a", "node-b"]

            [guest]
            user = "ubuntu"
            key_path = "/home/ci/.ssh/guest_rsa"

            [host]
            user = "ci"
            key_path = "/home/ci/.ssh/host_rsa"
        "#;

        let config = HarnessConfig::from_toml(raw).unwrap();
        assert_eq!(config.platform, Platform::Modern);
        assert_eq!(config.vms_version, VmsVersion::new(2, 4));
        assert_eq!(config.hosts, vec!["node-a", "node-b"]);
        assert_eq!(config.ops_timeout_secs, DEFAULT_OPS_TIMEOUT_SECS);
        assert_eq!(config.guest.user, "ubuntu");
        assert_eq!(config.host.key_path, "/home/ci/.ssh/host_rsa");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = HarnessConfig {
            platform: Platform::Legacy,
            vms_version: VmsVersion::new(2, 3),
            hosts: vec!["node-a".to_string()],
            ops_timeout_secs: 30,
            guest: Credentials {
                user: "root".to_string(),
                key_path: "/keys/guest".into(),
            },
            host: Credentials {
                user: "admin".to_string(),
                key_path: "/keys/host".into(),
            },
        };

        let out = toml::ser::to_string(&config).unwrap();
        assert_eq!(HarnessConfig::from_toml(&out).unwrap(), config);
    }

    #[test]
    fn set_success_code_depends_on_version() {
        assert_eq!(VmsVersion::new(2, 3).set_success_code(), 1);
        assert_eq!(VmsVersion::new(1, 9).set_success_code(), 1);
        assert_eq!(VmsVersion::new(2, 4).set_success_code(), 0);
        assert_eq!(VmsVersion::new(3, 0).set_success_code(), 0);
    }

    #[test]
    fn malformed_versions_are_rejected() {
        for bad in ["", "2", "2.x", "two.three", "2.3.1"] {
            assert!(bad.parse::<VmsVersion>().is_err(), "{bad} parsed");
        }
        assert_eq!(" 2.10 ".parse::<VmsVersion>().unwrap(), VmsVersion::new(2, 10));
    }
}
