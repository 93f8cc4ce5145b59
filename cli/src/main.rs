//! # Guest patch agent binary
//!
//! Thin wrapper over the library; all logic lives there.

// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

async fn run() -> Result<()> {
    tracing::trace!("starting");
    guestpatch_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(guestpatch_lib::cli::exit_code_for(&e));
    }
}
