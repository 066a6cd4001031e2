// ABOUTME: Shutdown helper that unmounts or remounts read-only every listed filesystem.
// ABOUTME: Tears mount points down in parallel, sub-mounts first, escalating against busy holders.

mod catalog;
mod config;
mod executor;
mod logging;
mod report;
mod scheduler;
mod shared;
mod tools;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;
use tracing::{error, info};

use crate::catalog::Catalog;
use crate::executor::Executor;
use crate::report::Mode;
use crate::shared::SharedMountSet;
use crate::tools::SystemTools;

/// Unmount, or remount read-only, every mounted filesystem at shutdown.
#[derive(Debug, Parser)]
#[command(name = "unmount-all", version, about)]
struct Cli {
    /// Command applied to each mount point, e.g. "umount" or "umount -r"
    operation: Option<String>,

    /// Arguments forwarded verbatim to the mount enumerator
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    mountinfo_args: Vec<OsString>,
}

/// Split the command line right after the operation. Options are only
/// recognised before it; everything after it, `-h` and `--` included, belongs
/// to the enumerator.
fn split_args(args: impl IntoIterator<Item = OsString>) -> (Vec<OsString>, Vec<OsString>) {
    let mut args = args.into_iter();
    let mut head: Vec<OsString> = args.next().into_iter().collect();
    let mut options_done = false;

    for arg in args.by_ref() {
        let is_option = !options_done && arg.to_str().is_some_and(|a| a.starts_with('-'));
        if !options_done && arg == "--" {
            options_done = true;
        }
        let is_operation = !is_option;
        head.push(arg);
        if is_operation {
            break;
        }
    }

    (head, args.collect())
}

fn main() -> ExitCode {
    logging::init();

    let (head, forwarded) = split_args(std::env::args_os());
    let mut cli = match Cli::try_parse_from(head) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    cli.mountinfo_args = forwarded;

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "aborting");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let Some(operation) = cli.operation else {
        bail!("no unmounting command provided");
    };

    let config = config::load_from_env()?;

    if !tools::command_available(&config.tools.shell, &config.tools.fuser) {
        bail!("{} is not installed, can't unmount anything", config.tools.fuser);
    }

    let (catalog, shared) = thread::scope(|scope| -> Result<(Catalog, SharedMountSet)> {
        let shared = scope.spawn(|| SharedMountSet::load(&config.shared.mountinfo));
        let catalog = Catalog::load(&config.tools.enumerator, &cli.mountinfo_args);
        let shared = shared
            .join()
            .map_err(|_| anyhow!("shared mount loader panicked"))?;
        Ok((catalog?, shared?))
    })?;

    if catalog.is_empty() {
        info!("nothing to unmount");
    }
    if !shared.is_empty() {
        info!(count = shared.len(), "shared mounts will be torn down one at a time");
    }

    let tools = SystemTools::new(&operation, &config);
    let shared_lock = Mutex::new(());
    let executor = Executor::new(&tools, &shared, &shared_lock);

    let results = scheduler::run(&catalog, &executor);

    let mode = Mode::from_command(&operation);
    let summary = report::report(mode, &results, std::io::stdout().lock())?;
    info!(
        total = summary.total,
        failed = summary.failed,
        "finished {} filesystems",
        match mode {
            Mode::Unmount => "unmounting",
            Mode::RemountReadOnly => "remounting",
        }
    );

    Ok(summary.exit_code())
}
