// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use vms_framework::{vmsctl::MemoryTarget, HarnessConfig};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a VM's identifier followed by its host and control handle.
    Locate(VmArgs),

    /// Print a VM's control-plane info record, or one field of it.
    Info(InfoArgs),

    Pause(VmArgs),
    Unpause(VmArgs),

    /// Read a control-plane parameter.
    Get(GetArgs),

    /// Write a control-plane parameter.
    Set(SetArgs),

    /// Set a VM's memory target, e.g. `512`, `512MB`, or `2GB`.
    Target(TargetArgs),

    /// Drop every resident page the host can.
    DropAll(VmArgs),

    /// Hoard a VM's memory until most of it is resident.
    Hoard(HoardArgs),

    /// Print a VM's generation number.
    Generation(VmArgs),

    /// Compare `KEY=VALUE` pairs against a VM's info record. Exits with a
    /// nonzero status if any of them differ.
    Match(MatchArgs),

    /// Print a host's vmsfs statistics as JSON.
    Stats(StatsArgs),

    /// Print the firewall rules a host holds for an instance.
    Firewall(FirewallArgs),

    /// Generate a name for a platform resource created by a test. Under CI
    /// the name carries the build number from `BUILD_NUMBER`.
    Name(NameArgs),
}

/// Runtime configuration options for the runner.
///
/// VMs are named by the identifier the compute platform assigned them; the
/// runner finds the host running each one by searching the configured hosts.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// The path to the harness configuration TOML.
    #[clap(long, value_parser, default_value = "vms-tests.toml")]
    pub config: Utf8PathBuf,

    /// Additional hosts to search for VMs, after those in the configuration.
    #[clap(long = "host", value_parser)]
    pub extra_hosts: Vec<String>,

    /// Override the configured bound on waits, in seconds.
    #[clap(long, value_parser)]
    pub ops_timeout_secs: Option<u64>,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

impl ProcessArgs {
    /// Loads the configuration file and applies command-line overrides.
    pub fn harness_config(&self) -> anyhow::Result<HarnessConfig> {
        let mut config = HarnessConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config))?;
        config.hosts.extend(self.extra_hosts.iter().cloned());
        if let Some(secs) = self.ops_timeout_secs {
            config.ops_timeout_secs = secs;
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct VmArgs {
    /// The platform's identifier for the VM.
    pub osid: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    pub osid: String,

    /// A single field to print, such as `generation` or `stats.eviction`.
    pub field: Option<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    pub osid: String,
    pub key: String,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    pub osid: String,
    pub key: String,
    pub value: String,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    pub osid: String,

    /// The new target. Zero or a negative value clears the target.
    #[clap(allow_hyphen_values = true)]
    pub target: MemoryTarget,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct HoardArgs {
    pub osid: String,

    /// The rate to hoard at.
    #[clap(long, default_value = "25")]
    pub rate: u32,

    /// How many one-second samples to take before giving up.
    #[clap(long, default_value = "120")]
    pub wait_seconds: u32,

    /// The fraction of the VM's memory that must be resident.
    #[clap(long, default_value = "0.9")]
    pub threshold: f64,
}

#[derive(Args, Debug)]
pub struct MatchArgs {
    pub osid: String,

    #[clap(value_parser = parse_key_value, required = true)]
    pub expected: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    pub host: String,

    /// Read a single generation's counters instead of the global ones.
    #[clap(long)]
    pub genid: Option<String>,
}

#[derive(Args, Debug)]
pub struct FirewallArgs {
    pub host: String,
    pub instance_id: String,
}

#[derive(Args, Debug)]
pub struct NameArgs {
    /// The test the resource belongs to.
    pub test_name: String,

    /// The start of the generated name, e.g. `master`.
    pub prefix: String,
}

fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{s}'"))?;
    Ok((key.to_owned(), value.to_owned()))
}
