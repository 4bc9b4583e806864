// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client for `vmsctl`, the control plane for VMS-enabled VMs on a
//! hypervisor host.
//!
//! A [`Vmsctl`] is bound to one VM on one host. If the VM migrates, the
//! binding is stale and a new client must be created with [`Vmsctl::locate`].

use std::{collections::BTreeMap, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    config::{HarnessConfig, VmsVersion},
    ssh::{CallOptions, CommandOutput, RemoteShell, SecureShell, ShellError},
};

pub mod discovery;
pub mod info;
pub mod memory;

pub use discovery::{ControlBinding, ControlHandle};
pub use info::{InfoRecord, InfoValue};
pub use memory::MemoryTarget;

const MEMORY_TARGET: &str = "memory.target";
const MEMORY_CURRENT: &str = "memory.current";
const MAX_PAGES: &str = "pages";
const HOARD: &str = "hoard";

/// The default interval between memory samples in [`Vmsctl::full_hoard`].
pub const DEFAULT_HOARD_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum VmsctlError {
    #[error("failed to run `vmsctl {args}` on {host}")]
    Exec {
        host: String,
        args: String,
        #[source]
        source: ShellError,
    },

    #[error(
        "vmsctl {action} for handle {vmsid} on {host} returned {code}\n\
         stdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    Action {
        host: String,
        action: String,
        vmsid: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error(
        "unexpected vmsctl response for handle {vmsid} on {host}: {detail}\n\
         output:\n{output}"
    )]
    Protocol { host: String, vmsid: String, detail: String, output: String },

    #[error("no host in {hosts:?} is running instance {osid}")]
    HandleNotFound { osid: String, hosts: Vec<String> },

    #[error("instance {osid} has no parameter '{key}'")]
    MissingParam { osid: String, key: String },

    #[error("bad instance identifier '{osid}': {reason}")]
    BadIdentifier { osid: String, reason: String },
}

/// A `vmsctl` session for one VM on one host.
pub struct Vmsctl<S> {
    osid: String,
    binding: ControlBinding,
    shell: S,
    version: VmsVersion,
    hoard_poll_interval: Duration,
}

impl Vmsctl<SecureShell> {
    /// Finds the host running platform instance `osid` among the configured
    /// hosts and binds a client to it.
    pub fn locate(
        osid: &str,
        config: &HarnessConfig,
    ) -> Result<Self, VmsctlError> {
        let connect =
            |host: &str| SecureShell::host(host, config.host.clone());
        let binding =
            discovery::locate(osid, config.platform, &config.hosts, connect)?;
        let shell = connect(&binding.host);
        Ok(Self::new(osid, binding, shell, config.vms_version))
    }
}

impl<S: RemoteShell> Vmsctl<S> {
    /// Binds a client to a VM whose host and handle are already known.
    /// `shell` must reach `binding.host`.
    pub fn new(
        osid: &str,
        binding: ControlBinding,
        shell: S,
        version: VmsVersion,
    ) -> Self {
        Self {
            osid: osid.to_owned(),
            binding,
            shell,
            version,
            hoard_poll_interval: DEFAULT_HOARD_POLL_INTERVAL,
        }
    }

    /// Overrides how often [`Vmsctl::full_hoard`] samples memory.
    pub fn with_hoard_poll_interval(mut self, interval: Duration) -> Self {
        self.hoard_poll_interval = interval;
        self
    }

    pub fn osid(&self) -> &str {
        &self.osid
    }

    pub fn host(&self) -> &str {
        &self.binding.host
    }

    pub fn handle(&self) -> &ControlHandle {
        &self.binding.handle
    }

    fn vmsid(&self) -> &str {
        self.binding.handle.as_str()
    }

    /// Runs `sudo vmsctl <args>` and returns the raw result.
    fn do_call(&self, args: &[&str]) -> Result<CommandOutput, VmsctlError> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.extend_from_slice(&["sudo", "vmsctl"]);
        argv.extend_from_slice(args);

        debug!(host = %self.binding.host, ?args, "vmsctl");
        self.shell.call(&argv, CallOptions::default()).map_err(|source| {
            VmsctlError::Exec {
                host: self.binding.host.clone(),
                args: args.join(" "),
                source,
            }
        })
    }

    fn expect_code(
        &self,
        args: &[&str],
        expected: i32,
    ) -> Result<CommandOutput, VmsctlError> {
        let output = self.do_call(args)?;
        if output.status != expected {
            error!(
                host = %self.binding.host,
                action = args[0],
                vmsid = self.vmsid(),
                error_code = output.status,
                expected,
                stderr = %output.stderr,
                "vmsctl command failed"
            );
            return Err(VmsctlError::Action {
                host: self.binding.host.clone(),
                action: args[0].to_owned(),
                vmsid: self.vmsid().to_owned(),
                code: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    fn action_call(&self, args: &[&str]) -> Result<CommandOutput, VmsctlError> {
        self.expect_code(args, 0)
    }

    fn set_call(&self, args: &[&str]) -> Result<(), VmsctlError> {
        self.expect_code(args, self.version.set_success_code()).map(|_| ())
    }

    fn protocol_error(
        &self,
        detail: impl Into<String>,
        output: &str,
    ) -> VmsctlError {
        VmsctlError::Protocol {
            host: self.binding.host.clone(),
            vmsid: self.vmsid().to_owned(),
            detail: detail.into(),
            output: output.to_owned(),
        }
    }

    pub fn pause(&self) -> Result<(), VmsctlError> {
        info!(osid = %self.osid, "pausing VM");
        self.action_call(&["pause", self.vmsid()]).map(|_| ())
    }

    pub fn unpause(&self) -> Result<(), VmsctlError> {
        info!(osid = %self.osid, "unpausing VM");
        self.action_call(&["unpause", self.vmsid()]).map(|_| ())
    }

    pub fn set_param(&self, key: &str, value: &str) -> Result<(), VmsctlError> {
        self.set_call(&["set", self.vmsid(), key, value])
    }

    /// Reads a parameter. The value is the first line of output with
    /// surrounding whitespace removed.
    pub fn get_param(&self, key: &str) -> Result<String, VmsctlError> {
        let output = self.action_call(&["get", self.vmsid(), key])?;
        Ok(output.stdout.lines().next().unwrap_or_default().trim().to_owned())
    }

    pub fn set_flag(&self, key: &str) -> Result<(), VmsctlError> {
        self.set_param(key, "1")
    }

    pub fn clear_flag(&self, key: &str) -> Result<(), VmsctlError> {
        self.set_param(key, "0")
    }

    fn get_int(&self, key: &str) -> Result<u64, VmsctlError> {
        let raw = self.get_param(key)?;
        raw.parse().map_err(|_| {
            self.protocol_error(format!("{key} is not an integer"), &raw)
        })
    }

    /// The memory target, in pages. Zero means no target is set.
    pub fn get_target(&self) -> Result<u64, VmsctlError> {
        self.get_int(MEMORY_TARGET)
    }

    pub fn set_target(&self, value: &str) -> Result<(), VmsctlError> {
        self.set_param(MEMORY_TARGET, value)
    }

    pub fn clear_target(&self) -> Result<(), VmsctlError> {
        self.set_param(MEMORY_TARGET, "0")
    }

    /// Pages currently resident for the VM.
    pub fn get_current_memory(&self) -> Result<u64, VmsctlError> {
        self.get_int(MEMORY_CURRENT)
    }

    /// The VM's total memory, in pages.
    pub fn get_max_memory(&self) -> Result<u64, VmsctlError> {
        self.get_int(MAX_PAGES)
    }

    /// Asks the host to drop every resident page it can.
    pub fn drop_all(&self) -> Result<(), VmsctlError> {
        self.set_call(&["dropall", self.vmsid()])
    }

    /// Starts fetching the VM's memory in the background at `rate`.
    pub fn launch_hoard(&self, rate: u32) -> Result<(), VmsctlError> {
        let rate = rate.to_string();
        self.set_call(&[HOARD, self.vmsid(), rate.as_str()])
    }

    pub fn stop_hoard(&self) -> Result<(), VmsctlError> {
        self.set_param(HOARD, "0")
    }

    /// Hoards at `rate` until resident memory exceeds `threshold` of the VM's
    /// total memory, then stops hoarding and returns `true`. Returns `false`
    /// if memory is still at or below the threshold after `wait_seconds`
    /// samples; the hoard is left running in that case.
    pub fn full_hoard(
        &self,
        rate: u32,
        wait_seconds: u32,
        threshold: f64,
    ) -> Result<bool, VmsctlError> {
        self.launch_hoard(rate)?;
        let max = self.get_max_memory()? as f64;
        let goal = threshold * max;

        let mut tries = 0;
        loop {
            let current = self.get_current_memory()?;
            if current as f64 > goal {
                break;
            }

            std::thread::sleep(self.hoard_poll_interval);
            tries += 1;
            if tries >= wait_seconds {
                info!(osid = %self.osid, current, goal, "hoard did not finish");
                return Ok(false);
            }
        }

        self.stop_hoard()?;
        Ok(true)
    }

    /// Fetches and decodes the control plane's view of the VM. The response
    /// must name this client's handle on its first line.
    pub fn info(&self) -> Result<InfoRecord, VmsctlError> {
        self.info_with_text().map(|(record, _)| record)
    }

    /// Like [`Vmsctl::info`], but also returns the raw response for use in
    /// diagnostics.
    fn info_with_text(&self) -> Result<(InfoRecord, String), VmsctlError> {
        let output = self.action_call(&["info", self.vmsid()])?;
        let mut lines = output.stdout.lines().map(str::trim);

        let header = lines.next().unwrap_or_default();
        let echoed = header.split(':').next().unwrap_or_default().trim();
        if echoed != self.vmsid() {
            return Err(self.protocol_error(
                format!("info header names handle '{echoed}'"),
                &output.stdout,
            ));
        }

        let body = lines.collect::<Vec<_>>().join(" ");
        let record = InfoRecord::parse(&body)
            .map_err(|e| self.protocol_error(e.to_string(), &output.stdout))?;
        Ok((record, output.stdout))
    }

    pub fn get_generation(&self) -> Result<i64, VmsctlError> {
        let (info, text) = self.info_with_text()?;
        info.get("generation").and_then(InfoValue::as_int).ok_or_else(|| {
            self.protocol_error("info has no integer generation", &text)
        })
    }

    /// Checks `expected` against the VM's info record, comparing values as
    /// strings. Every expected key must be present in the record.
    pub fn match_expected_params(
        &self,
        expected: &BTreeMap<String, String>,
    ) -> Result<bool, VmsctlError> {
        let info = self.info()?;
        for (key, want) in expected {
            let Some(got) = info.get(key) else {
                return Err(VmsctlError::MissingParam {
                    osid: self.osid.clone(),
                    key: key.clone(),
                });
            };

            let got = got.to_string();
            if got != *want {
                debug!(
                    osid = %self.osid,
                    key,
                    %got,
                    expected = %want,
                    "vmsctl parameter mismatch"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }
}
