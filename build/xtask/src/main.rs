// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Developer tasks for this workspace.
//!
//! The teacher's `xtask` cross-builds and flashes multi-task firmware images
//! (`dist`, `flash`, `humility`, ...); none of that has a counterpart here,
//! since this kernel has no `arch` layer and nothing to flash. What's left is
//! the one subcommand grounded on the teacher's `test.rs`: shell out to a
//! test runner and surface its exit status.

use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[clap(about = "extra tasks for this workspace")]
enum Xtask {
    /// Runs the workspace test suite.
    Test {
        /// Request verbose cargo output.
        #[clap(short)]
        verbose: bool,
        /// Only run tests for this package.
        #[clap(long)]
        package: Option<String>,
    },
}

fn main() -> Result<()> {
    match Xtask::parse() {
        Xtask::Test { verbose, package } => run_tests(verbose, package.as_deref()),
    }
}

fn run_tests(verbose: bool, package: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("test");
    match package {
        Some(p) => {
            cmd.arg("-p").arg(p);
        }
        None => {
            cmd.arg("--workspace");
        }
    }
    if verbose {
        cmd.arg("--verbose");
    }

    let status = cmd.status().with_context(|| format!("failed to run {:?}", cmd))?;
    if !status.success() {
        bail!("test run failed");
    }
    Ok(())
}
