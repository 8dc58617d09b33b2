//! roto - chroot build sandbox entry point.
//!
//! Parses the command line, checks that we were started through sudo or
//! userhelper, moves into a private mount namespace and runs the selected mode.
//! Errors are rendered by miette and turned into the documented exit codes.

use std::process::ExitCode;

use clap::Parser;
use miette::Report;
use nix::sys::stat::{Mode as FileMode, umask};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use roto_sandbox::build::Buildroot;
use roto_sandbox::cli::{self, Args};
use roto_sandbox::sandbox::{PrivilegeManager, unshare_namespace};
use roto_sandbox::system::{BUILD_GROUP, check_root, host_arch, in_build_group, invoking_user};
use roto_sandbox::Error;

fn main() -> miette::Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries --print-root-path and command output
    let filter = EnvFilter::from_default_env().add_directive(args.log_level().into());
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| miette::miette!("Failed to initialize logging: {e}"))?;

    info!("roto v{}", env!("CARGO_PKG_VERSION"));

    let code = match execute(&args) {
        Ok(()) => 0,
        Err(Error::CommandExit { code }) => {
            debug!(code, "Command in chroot exited non-zero");
            code
        }
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", Report::new(e));
            code
        }
    };
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}

fn execute(args: &Args) -> Result<(), Error> {
    let mode = args.mode()?;

    check_root()?;
    let user = invoking_user()?;
    if !in_build_group(&user) {
        warn!(uid = user.uid, group = BUILD_GROUP, "Invoking user is not in the build group");
    }
    let config = args.config(&user, &host_arch()?)?;
    debug!(?mode, root = %config.root_name(), "Configuration loaded");

    let previous = umask(FileMode::from_bits_truncate(0o002));
    debug!(previous = format!("{:o}", previous.bits()), "Set umask 002");

    if args.nounshare {
        warn!("Not unsharing the mount namespace (--nounshare)");
    } else {
        unshare_namespace()?;
    }

    let privs = PrivilegeManager::new(user.uid, user.gid);
    let mut root = Buildroot::new(config, privs)?;
    let result = cli::run(mode, &mut root, args);
    root.end();
    result
}
