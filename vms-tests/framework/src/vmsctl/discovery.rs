// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding the host and control handle of a VM given only the identifier the
//! compute platform assigned to it.
//!
//! The control plane has no index from platform identifiers to hosts, so the
//! only way to find a VM (especially after it has migrated) is to look for its
//! hypervisor process on every candidate host.

use std::fmt;

use tracing::{debug, info};

use super::VmsctlError;
use crate::{
    platform::Platform,
    ssh::{CallOptions, RemoteShell},
};

/// A host-local identifier for a VM's control-plane session. Handles are only
/// meaningful on the host that issued them and must be looked up again after
/// the VM migrates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlHandle(String);

impl ControlHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ControlHandle {
    fn from(pid: u64) -> Self {
        Self(pid.to_string())
    }
}

impl fmt::Display for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The host a VM currently runs on, and its handle there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlBinding {
    pub host: String,
    pub handle: ControlHandle,
}

/// The string that identifies a VM's hypervisor process in a host's process
/// table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostProcessMarker(String);

impl HostProcessMarker {
    /// Derives the marker for platform instance `osid`. Modern platforms name
    /// processes after the decimal identifier; the legacy platform uses the
    /// identifier as zero-padded hexadecimal.
    //
    // N.B. The legacy format has only been checked against the legacy
    // platform's naming scheme, not against live process tables.
    pub fn for_instance(
        osid: &str,
        platform: Platform,
    ) -> Result<Self, VmsctlError> {
        match platform {
            Platform::Modern => Ok(Self(osid.to_owned())),
            Platform::Legacy => {
                let numeric: u64 = osid.trim().parse().map_err(|_| {
                    VmsctlError::BadIdentifier {
                        osid: osid.to_owned(),
                        reason: "legacy instance identifiers must be integers"
                            .to_string(),
                    }
                })?;
                Ok(Self(format!("{numeric:08x}")))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shell pipeline that prints the process IDs of matching hypervisor
    /// processes.
    fn process_query(&self) -> String {
        format!(
            "ps aux | grep qemu-system | grep {} | grep -v ssh | awk '{{print $2}}'",
            self.0
        )
    }
}

/// Extracts a handle from the process query's output: the first line must be
/// a positive integer.
fn parse_handle(stdout: &str) -> Option<ControlHandle> {
    let first = stdout.lines().next()?.trim();
    match first.parse::<u64>() {
        Ok(pid) if pid > 0 => Some(ControlHandle::from(pid)),
        _ => None,
    }
}

/// Probes a single host for `marker`. Every failure here is a miss on this
/// host, not an error for the search as a whole.
fn probe_host<S: RemoteShell>(
    shell: &S,
    marker: &HostProcessMarker,
) -> Option<ControlHandle> {
    let query = marker.process_query();
    let output = match shell.call(&[query.as_str()], CallOptions::default()) {
        Ok(output) => output,
        Err(e) => {
            debug!(host = shell.host(), error = %e, "process query failed");
            return None;
        }
    };

    if !output.success() {
        debug!(
            host = shell.host(),
            status = output.status,
            stderr = %output.stderr,
            "process query returned an error"
        );
        return None;
    }

    let handle = parse_handle(&output.stdout);
    if handle.is_none() {
        debug!(
            host = shell.host(),
            stdout = %output.stdout,
            "no hypervisor process found"
        );
    }
    handle
}

/// Searches `hosts` in order for the VM with platform identifier `osid`,
/// creating a shell for each host with `connect`. Stops at the first host
/// where the VM is found.
pub fn locate<S, F>(
    osid: &str,
    platform: Platform,
    hosts: &[String],
    mut connect: F,
) -> Result<ControlBinding, VmsctlError>
where
    S: RemoteShell,
    F: FnMut(&str) -> S,
{
    let marker = HostProcessMarker::for_instance(osid, platform)?;

    for host in hosts {
        let shell = connect(host);
        if let Some(handle) = probe_host(&shell, &marker) {
            info!(osid, host = %host, %handle, "located VM");
            return Ok(ControlBinding { host: host.clone(), handle });
        }
    }

    Err(VmsctlError::HandleNotFound {
        osid: osid.to_owned(),
        hosts: hosts.to_vec(),
    })
}
