// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Parser;
use config::{Command, ProcessArgs};
use tracing::{debug, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};
use vms_framework::{
    context::TestContext, host::Host, vmsctl::InfoValue, HarnessConfig,
    SecureShell, Vmsctl,
};

fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    set_tracing_subscriber(&runner_args);
    info!(?runner_args);

    let config = runner_args.harness_config()?;
    let matched = run_command(&runner_args.command, &config)?;
    if !matched {
        debug!("exiting with failure status");
        std::process::exit(1);
    }

    Ok(())
}

fn locate(
    osid: &str,
    config: &HarnessConfig,
) -> anyhow::Result<Vmsctl<SecureShell>> {
    Vmsctl::locate(osid, config)
        .with_context(|| format!("locating instance {osid}"))
}

/// Runs `command`. Returns `false` if the command completed but its check
/// did not pass.
fn run_command(
    command: &Command,
    config: &HarnessConfig,
) -> anyhow::Result<bool> {
    match command {
        Command::Locate(args) => {
            let vms = locate(&args.osid, config)?;
            println!("{} {} {}", vms.osid(), vms.host(), vms.handle());
        }
        Command::Info(args) => {
            let info = locate(&args.osid, config)?.info()?;
            match &args.field {
                Some(field) => {
                    let value = info.get_path(field).with_context(|| {
                        format!("no field {field} in info record")
                    })?;
                    println!("{value}");
                }
                None => {
                    for key in info.keys() {
                        let value =
                            info.get(key).map(InfoValue::to_string);
                        println!("{key}: {}", value.unwrap_or_default());
                    }
                }
            }
        }
        Command::Pause(args) => locate(&args.osid, config)?.pause()?,
        Command::Unpause(args) => locate(&args.osid, config)?.unpause()?,
        Command::Get(args) => {
            println!("{}", locate(&args.osid, config)?.get_param(&args.key)?);
        }
        Command::Set(args) => {
            locate(&args.osid, config)?.set_param(&args.key, &args.value)?;
        }
        Command::Target(args) => {
            let pages = args.target.pages();
            info!(memory_target = %args.target, pages, "setting memory target");
            locate(&args.osid, config)?.set_target(&pages.to_string())?;
        }
        Command::DropAll(args) => locate(&args.osid, config)?.drop_all()?,
        Command::Hoard(args) => {
            let vms = locate(&args.osid, config)?;
            let done =
                vms.full_hoard(args.rate, args.wait_seconds, args.threshold)?;
            println!(
                "{}",
                if done { "hoard complete" } else { "hoard timed out" }
            );
            return Ok(done);
        }
        Command::Generation(args) => {
            println!("{}", locate(&args.osid, config)?.get_generation()?);
        }
        Command::Match(args) => {
            let expected: BTreeMap<String, String> =
                args.expected.iter().cloned().collect();
            let matched =
                locate(&args.osid, config)?.match_expected_params(&expected)?;
            println!("{}", if matched { "match" } else { "mismatch" });
            return Ok(matched);
        }
        Command::Stats(args) => {
            let stats = Host::connect(&args.host, config)
                .vmsfs_stats(args.genid.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Firewall(args) => {
            let rules = Host::connect(&args.host, config)
                .instance_firewall_rules(&args.instance_id)?;
            for rule in rules {
                println!("{rule}");
            }
        }
        Command::Name(args) => {
            let ctx = TestContext::from_env(args.test_name.as_str());
            debug!(
                test = ctx.test_name(),
                build_number = ?ctx.build_number(),
                "generating resource name"
            );
            println!("{}", ctx.generate_name(&args.prefix));
        }
    }

    Ok(true)
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("vms-runner".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}
