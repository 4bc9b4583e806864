// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-test state that is passed explicitly to the code that needs it.

use rand::Rng;

/// The environment variable CI jobs use to publish their build number.
pub const BUILD_NUMBER_VAR: &str = "BUILD_NUMBER";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestContext {
    test_name: String,
    build_number: Option<String>,
}

impl TestContext {
    pub fn new(test_name: impl Into<String>, build_number: Option<String>) -> Self {
        Self { test_name: test_name.into(), build_number }
    }

    /// Creates a context for `test_name`, picking up the CI build number from
    /// the environment if there is one.
    pub fn from_env(test_name: impl Into<String>) -> Self {
        let build_number = std::env::var(BUILD_NUMBER_VAR)
            .ok()
            .filter(|value| !value.is_empty());
        Self::new(test_name, build_number)
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn build_number(&self) -> Option<&str> {
        self.build_number.as_deref()
    }

    /// Generates a name for a platform resource. Names carry the build number
    /// under CI so leaked resources can be traced to a job, and a random
    /// suffix otherwise.
    pub fn generate_name(&self, prefix: &str) -> String {
        match &self.build_number {
            Some(build) => format!("{prefix}-{build}"),
            None => format!("{prefix}-{}", rand::thread_rng().gen::<u32>()),
        }
    }
}
