//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use eyre::WrapErr;

fn main() -> eyre::Result<()> {
    obstore_cli::run().wrap_err("obstore failed")
}
