// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shell doubles shared by the unit tests.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use crate::ssh::{CallOptions, CommandOutput, RemoteShell, ShellError};

/// A shell that records every command and replays canned results in order.
/// Once the script runs out, every call succeeds with no output.
pub(crate) struct ScriptedShell {
    host: String,
    responses: RefCell<VecDeque<CommandOutput>>,
    commands: RefCell<Vec<String>>,
    inputs: RefCell<Vec<Option<String>>>,
}

impl ScriptedShell {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            host: host.to_owned(),
            responses: RefCell::new(VecDeque::new()),
            commands: RefCell::new(Vec::new()),
            inputs: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, status: i32, stdout: &str, stderr: &str) {
        self.responses.borrow_mut().push_back(CommandOutput {
            status,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        });
    }

    pub(crate) fn push_ok(&self, stdout: &str) {
        self.push(0, stdout, "");
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub(crate) fn inputs(&self) -> Vec<Option<String>> {
        self.inputs.borrow().clone()
    }
}

impl RemoteShell for ScriptedShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        self.commands.borrow_mut().push(args.join(" "));
        self.inputs.borrow_mut().push(opts.input);
        Ok(self.responses.borrow_mut().pop_front().unwrap_or_default())
    }
}

/// A guest with an in-memory filesystem that understands the handful of
/// commands the breadcrumb trail issues. Files are shared between clones of
/// the same `FakeGuest` value; [`FakeGuest::fork`] copies them instead.
#[derive(Clone)]
pub(crate) struct FakeGuest {
    host: String,
    files: Rc<RefCell<BTreeMap<String, String>>>,
}

impl FakeGuest {
    pub(crate) fn new(host: &str) -> Self {
        Self { host: host.to_owned(), files: Rc::default() }
    }

    /// Produces a new guest whose disk starts as a copy of this one's.
    pub(crate) fn fork(&self, host: &str) -> Self {
        let files = self.files.borrow().clone();
        Self { host: host.to_owned(), files: Rc::new(RefCell::new(files)) }
    }

    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    pub(crate) fn write_file(&self, path: &str, contents: &str) {
        self.files.borrow_mut().insert(path.to_owned(), contents.to_owned());
    }

    pub(crate) fn remove_file(&self, path: &str) {
        self.files.borrow_mut().remove(path);
    }
}

impl RemoteShell for FakeGuest {
    fn host(&self) -> &str {
        &self.host
    }

    fn call(
        &self,
        args: &[&str],
        opts: CallOptions,
    ) -> Result<CommandOutput, ShellError> {
        let fail = |stderr: &str| CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_owned(),
        };

        let mut files = self.files.borrow_mut();
        let output = match args {
            ["true"] => CommandOutput::default(),
            ["cat", ">>", path] => {
                let entry = files.entry(path.to_string()).or_default();
                entry.push_str(opts.input.as_deref().unwrap_or_default());
                CommandOutput::default()
            }
            ["cat", path] => match files.get(*path) {
                // Guests reached with a pseudo-terminal translate newlines.
                Some(contents) if opts.use_tty(true) => CommandOutput {
                    stdout: contents.replace('\n', "\r\n"),
                    ..Default::default()
                },
                Some(contents) => CommandOutput {
                    stdout: contents.clone(),
                    ..Default::default()
                },
                None => fail("No such file or directory"),
            },
            ["test", "!", "-e", path] => {
                if files.contains_key(*path) {
                    fail("")
                } else {
                    CommandOutput::default()
                }
            }
            other => fail(&format!("unsupported command {other:?}")),
        };

        Ok(output)
    }
}
