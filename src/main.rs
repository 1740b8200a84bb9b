//! # thingsdb-pack: The Main Entry Point
//!
//! This module handles Command Line Interface (CLI) parsing, logging initialization,
//! and mapping the build outcome to an exit code.
//!
//! Before running it:
//! 1. Update the version in `ThingsDB.csproj`.
//! 2. Run `dotnet pack` from the `ThingsDB` folder.
//! 3. Run `thingsdb-pack <VERSION>` from the repository root, e.g. `thingsdb-pack 1.0.3`.

use clap::Parser;
use log::{error, debug, LevelFilter};
use simplelog::{Config, SimpleLogger};

mod discovery;
mod invariant_ppt;
mod nuspec;
mod packager;
mod system;
mod transform;

use system::HostSystem;
use transform::{Outcome, PackageProfile};

/// The primary Command Line Interface (CLI) configuration.
#[derive(Parser, Debug)]
#[command(name = "thingsdb-pack")]
#[command(version, about = "Fix up the ThingsDB nuspec and build the nuget package", long_about = None)]
struct Cli {
    /// Package version; must match `<version>` in the generated nuspec (e.g. 1.0.3).
    #[arg(value_name = "VERSION")]
    pkg_version: String,

    /// Show the fixed-up manifest, but don't ask, write or pack.
    #[arg(long)]
    dry_run: bool,

    /// Packaging executable to run.
    #[arg(long, env = "NUGET_EXE", default_value = "nuget")]
    nuget: String,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version are not usage errors.
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = SimpleLogger::init(log_level, Config::default());

    let profile = PackageProfile {
        packager: cli.nuget.clone(),
        ..PackageProfile::default()
    };

    let result = transform::run_build(&HostSystem, &profile, &cli.pkg_version, cli.dry_run);
    std::process::exit(exit_code(&result));
}

/// Maps a build result to the process exit code. The packager's own exit
/// code never leaks through.
fn exit_code(result: &anyhow::Result<Outcome>) -> i32 {
    match result {
        Ok(Outcome::Packed(output)) => {
            debug!("Packager exit code: {:?}", output.status);
            0
        }
        Ok(Outcome::DryRun) => 0,
        Ok(Outcome::Aborted) => {
            debug!("Aborted by operator");
            1
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}
