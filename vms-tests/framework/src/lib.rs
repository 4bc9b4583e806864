// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VMS test framework: interfaces for reaching guests and hypervisor
//! hosts, driving the `vmsctl` control plane, and checking that cloned VMs
//! keep a consistent history.

pub mod breadcrumbs;
pub mod config;
pub mod context;
pub mod host;
pub mod lifecycle;
pub mod platform;
pub mod scp;
pub mod ssh;
pub mod vmsctl;
pub mod wait;

#[cfg(test)]
pub(crate) mod test_support;

pub use breadcrumbs::Breadcrumbs;
pub use config::HarnessConfig;
pub use ssh::{RemoteShell, RootShell, SecureShell};
pub use vmsctl::Vmsctl;
pub use wait::Poller;
