// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks that run on a hypervisor host rather than in a guest.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, error};

use crate::{
    config::HarnessConfig,
    ssh::{CallOptions, RemoteShell, RootShell, SecureShell, ShellError},
};

const VMSFS_ROOT: &str = "/sys/fs/vmsfs";
const COMPUTE_CHAIN: &str = "nova-compute-local";

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("reading {path} returned {code}\nstderr: {stderr}")]
    Command { path: String, code: i32, stderr: String },

    #[error("malformed vmsfs statistics line '{line}'")]
    MalformedStats { line: String },
}

/// A hypervisor host reached over a host shell.
pub struct Host<S = SecureShell> {
    shell: S,
}

impl Host<SecureShell> {
    pub fn connect(name: &str, config: &HarnessConfig) -> Self {
        Self::new(SecureShell::host(name, config.host.clone()))
    }
}

impl<S: RemoteShell> Host<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    pub fn name(&self) -> &str {
        self.shell.host()
    }

    /// Reads the host's vmsfs counters: the global statistics, or those of a
    /// single generation if `genid` is given.
    pub fn vmsfs_stats(
        &self,
        genid: Option<&str>,
    ) -> Result<BTreeMap<String, u64>, HostError> {
        let path = match genid {
            Some(genid) => format!("{VMSFS_ROOT}/{genid}"),
            None => format!("{VMSFS_ROOT}/stats"),
        };

        let root = RootShell(&self.shell);
        let output = root.call(&["cat", path.as_str()], CallOptions::default())?;
        if !output.success() {
            error!(
                host = self.name(),
                %path,
                error_code = output.status,
                stderr = %output.stderr,
                "failed to read vmsfs statistics"
            );
            return Err(HostError::Command {
                path,
                code: output.status,
                stderr: output.stderr,
            });
        }

        output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse_stat_line)
            .collect()
    }

    /// Returns the rules in the firewall chain the compute service created
    /// for `instance_id` on this host, or nothing if the instance has no
    /// chain here.
    pub fn instance_firewall_rules(
        &self,
        instance_id: &str,
    ) -> Result<Vec<String>, HostError> {
        let instance_chain = format!("nova-compute-inst-{instance_id}");
        // The first column of a rule names the chain it jumps to.
        let has_chain =
            self.chain_rules(COMPUTE_CHAIN)?.iter().any(|rule| {
                rule.split_whitespace().next() == Some(instance_chain.as_str())
            });

        if !has_chain {
            debug!(host = self.name(), instance_id, "no firewall chain");
            return Ok(Vec::new());
        }

        self.chain_rules(&instance_chain)
    }

    /// Lists a chain's rules, skipping the chain and column headers.
    fn chain_rules(&self, chain: &str) -> Result<Vec<String>, HostError> {
        let output = RootShell(&self.shell)
            .check_output(&["iptables", "-L", chain], CallOptions::default())?;
        Ok(output
            .stdout
            .lines()
            .skip(2)
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Parses one `<name>: <count> - <description>` statistics line.
fn parse_stat_line(line: &str) -> Result<(String, u64), HostError> {
    let malformed = || HostError::MalformedStats { line: line.to_owned() };

    let (key, rest) = line.split_once(": ").ok_or_else(malformed)?;
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
    {
        return Err(malformed());
    }

    let (count, tail) = rest.split_once(' ').ok_or_else(malformed)?;
    if !tail.starts_with('-') || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let count = count.parse().map_err(|_| malformed())?;
    Ok((key.to_owned(), count))
}
