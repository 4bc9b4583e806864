// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers that walk VMs through the clone lifecycle (bless, launch,
//! migrate, discard) while keeping each VM's breadcrumb trail in step.

use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{
    breadcrumbs::{Breadcrumbs, Snapshot},
    context::TestContext,
    platform::{
        clone_api, ApiError, CloneApi, ComputeEndpoint, InstanceRecord,
        InstanceStatus, LaunchParams, Platform,
    },
    ssh::{wait_for_ssh, RemoteShell},
    wait::{Poller, DEFAULT_POLL_INTERVAL},
};

/// A running VM and the trail of events recorded on its disk.
pub struct TrackedVm<S> {
    pub record: InstanceRecord,
    pub breadcrumbs: Breadcrumbs<S>,
}

impl<S: RemoteShell> TrackedVm<S> {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Drives clone operations against one platform for one test.
pub struct CloneHarness<'a, E> {
    api: Box<dyn CloneApi + 'a>,
    endpoint: &'a E,
    poller: Poller,
    poll_interval: Duration,
    ctx: TestContext,

    /// Trails as they were when each blessed template was created, keyed by
    /// the template's ID.
    snapshots: BTreeMap<String, Snapshot>,
}

impl<'a, E: ComputeEndpoint> CloneHarness<'a, E> {
    pub fn new(
        platform: Platform,
        endpoint: &'a E,
        poller: Poller,
        ctx: TestContext,
    ) -> Self {
        Self {
            api: clone_api(platform, endpoint),
            endpoint,
            poller,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ctx,
            snapshots: BTreeMap::new(),
        }
    }

    /// Overrides how often instance state is polled.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn context(&self) -> &TestContext {
        &self.ctx
    }

    /// Starts tracking a freshly booted master reachable through `shell`.
    pub fn track_master<S: RemoteShell>(
        &self,
        record: InstanceRecord,
        shell: S,
    ) -> anyhow::Result<TrackedVm<S>> {
        let mut breadcrumbs = Breadcrumbs::new(shell);
        breadcrumbs.add(&format!("Booted master {}", record.id))?;
        Ok(TrackedVm { record, breadcrumbs })
    }

    /// Blesses `master` and waits for the new template to settle.
    #[instrument(skip_all, fields(master = %master.record.id))]
    pub fn bless<S: RemoteShell>(
        &mut self,
        master: &mut TrackedVm<S>,
    ) -> anyhow::Result<InstanceRecord> {
        info!(test = self.ctx.test_name(), "blessing master");
        master.breadcrumbs.add("Pre bless")?;

        let blessed = only_child(self.api.bless(&master.record.id)?, "bless")?;
        anyhow::ensure!(
            blessed.id != master.record.id,
            "blessed template reused master ID {}",
            blessed.id
        );
        anyhow::ensure!(
            blessed.metadata.get("blessed_from") == Some(&master.record.id),
            "template {} does not record its master: {:?}",
            blessed.id,
            blessed.metadata
        );
        anyhow::ensure!(
            blessed.name.contains(&master.record.name),
            "template name {} does not extend master name {}",
            blessed.name,
            master.record.name
        );

        self.snapshots
            .insert(blessed.id.clone(), master.breadcrumbs.snapshot());

        let blessed = self
            .wait_while_status(&blessed.id, InstanceStatus::Building)?;
        anyhow::ensure!(
            blessed.status == InstanceStatus::Blessed,
            "template {} settled in state {}",
            blessed.id,
            blessed.status
        );

        master
            .breadcrumbs
            .add(&format!("Post bless, child is {}", blessed.id))?;
        Ok(blessed)
    }

    /// Launches a clone of `blessed`. Once the clone is active, `shell_for`
    /// produces a shell into it, and the clone's trail is picked up from the
    /// point at which `blessed` was created.
    #[instrument(skip_all, fields(blessed = %blessed.id))]
    pub fn launch<S, F>(
        &self,
        blessed: &InstanceRecord,
        params: &LaunchParams,
        shell_for: F,
    ) -> anyhow::Result<TrackedVm<S>>
    where
        S: RemoteShell,
        F: FnOnce(&InstanceRecord) -> anyhow::Result<S>,
    {
        let snapshot = self.snapshots.get(&blessed.id).with_context(|| {
            format!("{} was not blessed by this harness", blessed.id)
        })?;

        let launched =
            only_child(self.api.launch(&blessed.id, params)?, "launch")?;
        anyhow::ensure!(
            launched.id != blessed.id,
            "clone reused template ID {}",
            launched.id
        );
        anyhow::ensure!(
            launched.metadata.get("launched_from") == Some(&blessed.id),
            "clone {} does not record its template: {:?}",
            launched.id,
            launched.metadata
        );
        anyhow::ensure!(
            launched.name.contains(&blessed.name),
            "clone name {} does not extend template name {}",
            launched.name,
            blessed.name
        );

        let launched = self
            .wait_while_status(&launched.id, InstanceStatus::Building)?;
        anyhow::ensure!(
            launched.status == InstanceStatus::Active,
            "clone {} settled in state {}",
            launched.id,
            launched.status
        );

        let shell = shell_for(&launched)?;
        wait_for_ssh(&self.poller, &shell)?;

        let mut breadcrumbs = snapshot.instantiate(shell);
        breadcrumbs.add(&format!("Post launch {}", launched.id))?;
        info!(
            clone = %launched.id,
            addrs = ?launched.addrs(),
            "clone launched"
        );
        Ok(TrackedVm { record: launched, breadcrumbs })
    }

    /// Moves `vm` to host `dest` and waits for it to run there.
    #[instrument(skip_all, fields(vm = %vm.record.id, dest = %dest))]
    pub fn migrate<S: RemoteShell>(
        &self,
        vm: &mut TrackedVm<S>,
        dest: &str,
    ) -> anyhow::Result<()> {
        vm.breadcrumbs.add(&format!("Pre migrate to {dest}"))?;
        self.api.migrate(&vm.record.id, Some(dest))?;

        let mut latest = None;
        self.poller.wait_for_every(
            &format!("{} to run on {dest}", vm.record.id),
            self.poll_interval,
            || {
                let record = self.endpoint.get_instance(&vm.record.id)?;
                let done = record.host.as_deref() == Some(dest)
                    && record.status == InstanceStatus::Active;
                latest = Some(record);
                Ok::<_, ApiError>(done)
            },
        )?;

        if let Some(record) = latest {
            vm.record = record;
        }
        vm.breadcrumbs.add(&format!("Post migrate to {dest}"))?;
        Ok(())
    }

    /// Discards the template `blessed` and waits for the platform to forget
    /// it.
    #[instrument(skip_all, fields(blessed = %blessed.id))]
    pub fn discard(&mut self, blessed: &InstanceRecord) -> anyhow::Result<()> {
        self.api.discard(&blessed.id)?;
        self.poller.wait_for_every(
            &format!("{} to be discarded", blessed.id),
            self.poll_interval,
            || match self.endpoint.get_instance(&blessed.id) {
                Ok(_) => Ok(false),
                Err(ApiError::NotFound(_)) => Ok(true),
                Err(e) => Err(e),
            },
        )?;

        self.snapshots.remove(&blessed.id);
        Ok(())
    }

    /// Polls instance `id` until it leaves `status` and returns its new
    /// record.
    pub fn wait_while_status(
        &self,
        id: &str,
        status: InstanceStatus,
    ) -> anyhow::Result<InstanceRecord> {
        let mut latest = None;
        self.poller.wait_for_every(
            &format!("{id} to leave {status}"),
            self.poll_interval,
            || {
                let record = self.endpoint.get_instance(id)?;
                let left = record.status != status;
                latest = Some(record);
                Ok::<_, ApiError>(left)
            },
        )?;

        latest.with_context(|| format!("no record fetched for {id}"))
    }
}

fn only_child(
    mut records: Vec<InstanceRecord>,
    action: &str,
) -> anyhow::Result<InstanceRecord> {
    anyhow::ensure!(
        records.len() == 1,
        "{action} returned {} instances, expected 1",
        records.len()
    );
    Ok(records.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGuest;
    use serde_json::{json, Value};
    use std::cell::{Cell, RefCell};

    /// A platform where new instances build for one poll before settling.
    #[derive(Default)]
    struct FakePlatform {
        instances: RefCell<BTreeMap<String, (InstanceRecord, u32)>>,
        next_id: Cell<u32>,

        /// Launch clones without `launched_from` metadata.
        forget_lineage: Cell<bool>,

        /// Launch clones under a name unrelated to their template's.
        rename_clones: Cell<bool>,
    }

    impl FakePlatform {
        fn boot(&self, name: &str) -> InstanceRecord {
            let id =
                self.create(name, InstanceStatus::Active, BTreeMap::new()).id;
            let mut instances = self.instances.borrow_mut();
            let entry = instances.get_mut(&id).unwrap();
            entry.1 = 0;
            entry.0.clone()
        }

        fn create(
            &self,
            name: &str,
            settled: InstanceStatus,
            metadata: BTreeMap<String, String>,
        ) -> InstanceRecord {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            let record = InstanceRecord {
                id: id.to_string(),
                name: name.to_string(),
                status: settled,
                host: Some("node-a".to_string()),
                metadata,
                addresses: BTreeMap::new(),
            };
            self.instances
                .borrow_mut()
                .insert(record.id.clone(), (record.clone(), 1));
            InstanceRecord { status: InstanceStatus::Building, ..record }
        }

        fn servers(records: Vec<InstanceRecord>) -> Value {
            json!({ "servers": records })
        }
    }

    impl ComputeEndpoint for FakePlatform {
        fn get_instance(&self, id: &str) -> Result<InstanceRecord, ApiError> {
            let mut instances = self.instances.borrow_mut();
            let (record, builds_left) = instances
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound(id.to_owned()))?;
            if *builds_left > 0 {
                *builds_left -= 1;
                return Ok(InstanceRecord {
                    status: InstanceStatus::Building,
                    ..record.clone()
                });
            }
            Ok(record.clone())
        }

        fn instance_action(
            &self,
            id: &str,
            action: &str,
            body: Value,
        ) -> Result<Value, ApiError> {
            let parent = self
                .instances
                .borrow()
                .get(id)
                .map(|(r, _)| r.clone())
                .ok_or_else(|| ApiError::NotFound(id.to_owned()))?;

            match action {
                "gc_bless" => {
                    let metadata = BTreeMap::from([(
                        "blessed_from".to_string(),
                        parent.id.clone(),
                    )]);
                    let child = self.create(
                        &format!("{}-0", parent.name),
                        InstanceStatus::Blessed,
                        metadata,
                    );
                    Ok(Self::servers(vec![child]))
                }
                "gc_launch" => {
                    let mut metadata = BTreeMap::new();
                    if !self.forget_lineage.get() {
                        metadata.insert(
                            "launched_from".to_string(),
                            parent.id.clone(),
                        );
                    }
                    let name = if self.rename_clones.get() {
                        "stray".to_string()
                    } else {
                        format!("{}-clone", parent.name)
                    };
                    let child =
                        self.create(&name, InstanceStatus::Active, metadata);
                    Ok(Self::servers(vec![child]))
                }
                "gc_migrate" => {
                    let dest = body["dest"].as_str().map(str::to_owned);
                    let mut instances = self.instances.borrow_mut();
                    let entry = instances.get_mut(id).unwrap();
                    entry.0.host = dest;
                    Ok(Value::Null)
                }
                "gc_discard" => {
                    self.instances.borrow_mut().remove(id);
                    Ok(Value::Null)
                }
                other => Err(ApiError::Rejected {
                    code: 400,
                    message: format!("unsupported action {other}"),
                }),
            }
        }
    }

    fn harness(platform: &FakePlatform) -> CloneHarness<'_, FakePlatform> {
        CloneHarness::new(
            Platform::Modern,
            platform,
            Poller::new(Duration::from_secs(5)),
            TestContext::new("bless_launch", Some("99".to_string())),
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn bless_launch_discard_keeps_trails_consistent() {
        let platform = FakePlatform::default();
        let mut harness = harness(&platform);

        let name = harness.context().generate_name("master");
        let master_guest = FakeGuest::new("10.0.0.2");
        let mut master = harness
            .track_master(platform.boot(&name), master_guest.clone())
            .unwrap();

        let blessed = harness.bless(&mut master).unwrap();
        assert_eq!(blessed.status, InstanceStatus::Blessed);
        assert_eq!(
            master.breadcrumbs.entries(),
            [
                "0: Booted master 1",
                "1: Pre bless",
                "2: Post bless, child is 2"
            ]
        );

        // The clone's disk is the master's disk as of the bless.
        let clone_guest = master_guest.fork("10.0.0.3");
        clone_guest.write_file(
            master.breadcrumbs.path(),
            "0: Booted master 1\n1: Pre bless\n",
        );
        let launched = harness
            .launch(&blessed, &LaunchParams::default(), |_| {
                Ok(clone_guest.clone())
            })
            .unwrap();

        assert_eq!(launched.record.status, InstanceStatus::Active);
        assert_eq!(
            launched.breadcrumbs.entries(),
            ["0: Booted master 1", "1: Pre bless", "2: Post launch 3"]
        );
        master.breadcrumbs.verify().unwrap();

        harness.discard(&blessed).unwrap();
        assert!(matches!(
            platform.get_instance(&blessed.id),
            Err(ApiError::NotFound(_))
        ));
        let relaunch = harness.launch(&blessed, &LaunchParams::default(), |_| {
            Ok(clone_guest.clone())
        });
        assert!(relaunch.is_err());
    }

    #[test]
    fn launch_checks_clone_lineage() {
        let platform = FakePlatform::default();
        let mut harness = harness(&platform);
        let master_guest = FakeGuest::new("10.0.0.2");
        let mut master = harness
            .track_master(platform.boot("master"), master_guest.clone())
            .unwrap();
        let blessed = harness.bless(&mut master).unwrap();

        let launch = |harness: &CloneHarness<'_, FakePlatform>| {
            harness.launch(&blessed, &LaunchParams::default(), |_| {
                Ok(master_guest.fork("10.0.0.3"))
            })
        };

        platform.forget_lineage.set(true);
        let err = launch(&harness).err().unwrap();
        assert!(err.to_string().contains("does not record its template"));

        platform.forget_lineage.set(false);
        platform.rename_clones.set(true);
        let err = launch(&harness).err().unwrap();
        assert!(err.to_string().contains("does not extend template name"));
    }

    #[test]
    fn migration_waits_for_destination() {
        let platform = FakePlatform::default();
        let harness = harness(&platform);
        let guest = FakeGuest::new("10.0.0.2");
        let mut vm = harness.track_master(platform.boot("m"), guest).unwrap();

        harness.migrate(&mut vm, "node-b").unwrap();
        assert_eq!(vm.record.host.as_deref(), Some("node-b"));
        assert_eq!(
            vm.breadcrumbs.entries(),
            [
                "0: Booted master 1",
                "1: Pre migrate to node-b",
                "2: Post migrate to node-b"
            ]
        );
    }

    #[test]
    fn launching_unknown_template_fails() {
        let platform = FakePlatform::default();
        let harness = harness(&platform);
        let stranger = platform.boot("stranger");
        let result = harness.launch(&stranger, &LaunchParams::default(), |_| {
            Ok(FakeGuest::new("10.0.0.9"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn status_waits_time_out() {
        let platform = FakePlatform::default();
        let record = platform.boot("m");
        let harness = CloneHarness::new(
            Platform::Modern,
            &platform,
            Poller::new(Duration::from_millis(100)),
            TestContext::new("timeout", None),
        )
        .with_poll_interval(Duration::from_millis(10));

        let err = harness
            .wait_while_status(&record.id, InstanceStatus::Active)
            .unwrap_err();
        assert!(err.to_string().contains("timeout"), "{err:#}");
    }
}
