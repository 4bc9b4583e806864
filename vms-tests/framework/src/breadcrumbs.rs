// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An append-only trail of events recorded both on a guest's disk and in the
//! harness.
//!
//! Clones inherit their parent's disk, so a clone's trail must start with
//! exactly the entries its parent had when it was blessed. Comparing the file
//! on the guest against the harness's copy after every step catches clones
//! that came up with the wrong disk or lost writes.
//!
//! The harness's copy is forked with [`Breadcrumbs::snapshot`] when a VM is
//! blessed, and each launched clone gets its own trail from
//! [`Snapshot::instantiate`].

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::ssh::{CallOptions, RemoteShell, ShellError};

#[derive(Debug, Error)]
pub enum BreadcrumbError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(
        "breadcrumbs in {path} diverged\nexpected: {expected:?}\nfound: {found:?}"
    )]
    Diverged { path: String, expected: Vec<String>, found: Vec<String> },

    #[error("breadcrumb {breadcrumb:?} spans more than one line")]
    MultiLine { breadcrumb: String },
}

/// A value copy of a trail, taken before a VM is cloned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    path: String,
    entries: Vec<String>,
}

impl Snapshot {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Starts a trail for a clone reachable through `shell`. The clone's disk
    /// holds the file at the same path.
    pub fn instantiate<S: RemoteShell>(&self, shell: S) -> Breadcrumbs<S> {
        Breadcrumbs {
            shell,
            path: self.path.clone(),
            entries: self.entries.clone(),
        }
    }
}

pub struct Breadcrumbs<S> {
    shell: S,
    path: String,
    entries: Vec<String>,
}

impl<S: RemoteShell> Breadcrumbs<S> {
    /// Starts an empty trail on `shell`'s guest under a fresh random path.
    pub fn new(shell: S) -> Self {
        let path =
            format!("/tmp/test-breadcrumbs-{}", rand::thread_rng().gen::<u32>());
        Self { shell, path, entries: Vec::new() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot { path: self.path.clone(), entries: self.entries.clone() }
    }

    /// Appends `breadcrumb`, numbered by its position in the trail. The trail
    /// is verified before and after the write. Each entry is one line of the
    /// file, so breadcrumbs containing line breaks are refused.
    pub fn add(&mut self, breadcrumb: &str) -> Result<(), BreadcrumbError> {
        if breadcrumb.contains(&['\n', '\r'][..]) {
            return Err(BreadcrumbError::MultiLine {
                breadcrumb: breadcrumb.to_owned(),
            });
        }

        self.verify()?;

        let entry = format!("{}: {}", self.entries.len(), breadcrumb);
        debug!(host = self.shell.host(), %entry, "adding breadcrumb");
        self.shell.check_output(
            &["cat", ">>", self.path.as_str()],
            CallOptions::with_input(format!("{entry}\n")),
        )?;
        self.entries.push(entry);

        self.verify()
    }

    /// Checks that the guest's file holds exactly this trail. An empty trail
    /// means the file must not exist yet.
    pub fn verify(&self) -> Result<(), BreadcrumbError> {
        if self.entries.is_empty() {
            self.shell.check_output(
                &["test", "!", "-e", self.path.as_str()],
                CallOptions::default(),
            )?;
            return Ok(());
        }

        let output = self
            .shell
            .check_output(&["cat", self.path.as_str()], CallOptions::default())?;
        let found = parse_trail(&output.stdout);
        debug!(host = self.shell.host(), ?found, "read breadcrumbs");

        if found != self.entries {
            return Err(BreadcrumbError::Diverged {
                path: self.path.clone(),
                expected: self.entries.clone(),
                found,
            });
        }

        Ok(())
    }
}

/// Splits file contents into entries. Pseudo-terminals turn `\n` into
/// `\r\n`, and the final newline doesn't start an entry.
fn parse_trail(contents: &str) -> Vec<String> {
    let mut lines: Vec<String> = contents
        .split('\n')
        .map(|line| line.trim_matches('\r').to_owned())
        .collect();
    lines.pop();
    lines
}
