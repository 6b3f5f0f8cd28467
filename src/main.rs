//! # run-chain CLI
//!
//! Command-line interface for the altimetry chain runner.
//!
//! ## Usage
//! ```bash
//! run-chain run chain.toml --year 2020 --month 1
//! run-chain run chain.toml -m --max-processes 8 --log-dir logs --output json
//! ```

mod cli;

use altimetry_chain::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    cli::run()
}
