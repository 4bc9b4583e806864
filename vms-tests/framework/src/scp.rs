// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copying files to and from remote machines with `scp`.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, error};

use crate::{config::Credentials, ssh::transport_opts};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("local path {path} does not exist")]
    MissingLocalPath {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run scp")]
    Spawn(#[source] std::io::Error),

    #[error("failed scp transfer {source_path} -> {destination}\nstderr: {stderr}")]
    Failed { source_path: String, destination: String, stderr: String },
}

/// Moves files between this machine and one remote machine, using the same
/// credentials as the machine's [`crate::SecureShell`].
#[derive(Clone, Debug)]
pub struct TransferChannel {
    host: String,
    creds: Credentials,
}

impl TransferChannel {
    pub fn new(host: impl Into<String>, creds: Credentials) -> Self {
        Self { host: host.into(), creds }
    }

    fn remote_spec(&self, remote_path: &str) -> String {
        format!("{}@{}:{}", self.creds.user, self.host, remote_path)
    }

    /// Copies `local_path` to `remote_path` on the remote machine. The local
    /// file must exist.
    pub fn put_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), TransferError> {
        std::fs::metadata(local_path).map_err(|source| {
            TransferError::MissingLocalPath { path: local_path.to_owned(), source }
        })?;

        self.scp(local_path.as_str(), &self.remote_spec(remote_path))
    }

    /// Copies `remote_path` from the remote machine to `local_path`. If
    /// `local_path` doesn't exist yet, its parent directory must.
    pub fn get_file(
        &self,
        remote_path: &str,
        local_path: &Utf8Path,
    ) -> Result<(), TransferError> {
        if std::fs::metadata(local_path).is_err() {
            let parent = match local_path.parent() {
                Some(p) if !p.as_str().is_empty() => p,
                _ => Utf8Path::new("."),
            };
            std::fs::metadata(parent).map_err(|source| {
                TransferError::MissingLocalPath { path: parent.to_owned(), source }
            })?;
        }

        self.scp(&self.remote_spec(remote_path), local_path.as_str())
    }

    fn scp(&self, source: &str, destination: &str) -> Result<(), TransferError> {
        let opts = transport_opts(&self.creds, false);
        debug!(?opts, source, destination, "executing scp");

        let output = Command::new("scp")
            .args(&opts)
            .arg(source)
            .arg(destination)
            .output()
            .map_err(TransferError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                source,
                destination,
                error_code = output.status.code(),
                %stderr,
                "scp transfer failed"
            );
            return Err(TransferError::Failed {
                source_path: source.to_owned(),
                destination: destination.to_owned(),
                stderr,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> TransferChannel {
        TransferChannel::new(
            "192.0.2.1",
            Credentials { user: "ci".to_string(), key_path: "/keys/k".into() },
        )
    }

    #[test]
    fn put_requires_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing =
            Utf8PathBuf::from_path_buf(dir.path().join("nope")).unwrap();
        let err = channel().put_file(&missing, "/tmp/nope").unwrap_err();
        assert!(
            matches!(err, TransferError::MissingLocalPath { ref path, .. } if *path == missing)
        );
    }

    #[test]
    fn get_requires_existing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::from_path_buf(
            dir.path().join("no-such-dir").join("file"),
        )
        .unwrap();
        let err = channel().get_file("/etc/hostname", &target).unwrap_err();
        match err {
            TransferError::MissingLocalPath { path, .. } => {
                assert_eq!(path, target.parent().unwrap());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn remote_spec_uses_credentials() {
        assert_eq!(channel().remote_spec("/tmp/x"), "ci@192.0.2.1:/tmp/x");
    }
}
