#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
mod capture;
mod config;
pub(crate) mod error;
mod http_server;
pub(crate) mod mail;
mod process;
mod resources;
#[cfg(test)]
mod smtp_client;
pub(crate) mod smtp_server;
pub(crate) mod store;
pub(crate) mod template;
pub(crate) mod utils;
mod views;

use capture::CaptureHandler;
use clap::Parser;
use config::Config;
use env_logger::Env;
use error::Error;
use http_server::run_http_server;
use resources::Resources;
use smtp_server::{bind, run_smtp_server};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::MailStore;
use tokio::net::TcpListener;
use views::MailView;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit code of `--ctl-status` when no instance is running.
const EXIT_NOT_RUNNING: i32 = 3;

/// Test MTA: accepts all mail over SMTP and shows it on a web page.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Go into the background after starting
    #[arg(short, long, conflicts_with = "interactive")]
    daemonize: bool,
    /// Stay in the foreground, even if the configuration says otherwise
    #[arg(short, long)]
    interactive: bool,
    /// Directory with the templates and static files
    #[arg(long, value_name = "DIR")]
    resourcedir: Option<PathBuf>,
    /// File to write the process id to, relative to the chroot
    #[arg(long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
    /// Report whether mockmail is running
    #[arg(long, conflicts_with_all = ["ctl_start", "ctl_stop"])]
    ctl_status: bool,
    /// Start mockmail in the background unless it is running already
    #[arg(long, conflicts_with = "ctl_stop")]
    ctl_start: bool,
    /// Stop the running mockmail
    #[arg(long)]
    ctl_stop: bool,
    /// Do not announce what the --ctl-* options do
    #[arg(long)]
    quiet_ctl: bool,
    /// Do not run mockmail, but dump the effective configuration
    #[arg(long)]
    dumpconfig: bool,
    /// Do not run mockmail, but check that the resource directory is set correctly
    #[arg(long)]
    check_resourcedir: bool,
    /// Set for the background process started by --daemonize
    #[arg(long, hide = true)]
    detached: bool,
}

impl Cli {
    /// Lets the command line override the configuration file.
    fn apply(&self, config: &mut Config) {
        if self.daemonize {
            config.daemonize = true;
        }
        if self.interactive {
            config.daemonize = false;
        }
        if let Some(pidfile) = &self.pidfile {
            config.pidfile = Some(pidfile.clone());
        }
        if let Some(resourcedir) = &self.resourcedir {
            config.resourcedir = Some(resourcedir.clone());
        }
    }

    /// Arguments for a background process serving the same configuration.
    fn child_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--config", &self.config),
            ("--resourcedir", &self.resourcedir),
            ("--pidfile", &self.pidfile),
        ] {
            if let Some(value) = value {
                args.push(OsString::from(flag));
                args.push(value.clone().into_os_string());
            }
        }
        args
    }

    fn ctl(&self) -> bool {
        self.ctl_status || self.ctl_start || self.ctl_stop
    }
}

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if cli.detached {
                process::notify_failure(&e);
            }
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> Result<i32, Error> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    if cli.dumpconfig {
        println!("{}", config.to_json()?);
        return Ok(0);
    }

    let resourcedir = std::path::absolute(
        config
            .resourcedir
            .clone()
            .unwrap_or_else(resources::default_dir),
    )?;

    if cli.check_resourcedir {
        println!("Loading resources from {} ...", resourcedir.display());
        Resources::open(&resourcedir, false)?;
        return Ok(0);
    }

    if cli.ctl() {
        return control(cli, &config);
    }

    if let Some(pidfile) = config.effective_pidfile() {
        if let Some(pid) = process::read_pid(&pidfile)? {
            return Err(Error::AlreadyRunning { pid, path: pidfile });
        }
    }

    if cli.detached {
        process::detach()?;
    } else if config.daemonize {
        let pid = process::spawn_detached(cli.child_args())?;
        log::info!("Continuing in the background as pid {pid}");
        return Ok(0);
    }

    serve(config, &resourcedir, cli.detached).await?;
    Ok(0)
}

/// Handles `--ctl-status`, `--ctl-start` and `--ctl-stop`.
fn control(cli: &Cli, config: &Config) -> Result<i32, Error> {
    let pidfile = config.effective_pidfile().ok_or(Error::NoPidfile)?;
    let announce = |message: &str| -> std::io::Result<()> {
        if !cli.quiet_ctl {
            let mut stdout = std::io::stdout();
            stdout.write_all(message.as_bytes())?;
            stdout.flush()?;
        }
        Ok(())
    };

    if cli.ctl_status {
        return Ok(match process::read_pid(&pidfile)? {
            Some(_) => {
                announce("mockmail is running.\n")?;
                0
            }
            None => {
                announce("mockmail is NOT running.\n")?;
                EXIT_NOT_RUNNING
            }
        });
    }

    if cli.ctl_stop {
        announce("Stopping Test MTA: mockmail ...")?;
        process::stop(&pidfile)?;
        announce(".\n")?;
        return Ok(0);
    }

    announce("Starting Test MTA: mockmail")?;
    if let Some(pid) = process::read_pid(&pidfile)? {
        println!(" (pid {pid}) already running.");
        return Ok(0);
    }
    if let Err(e) = process::spawn_detached(cli.child_args()) {
        announce("\n")?;
        return Err(e);
    }
    announce(".\n")?;
    Ok(0)
}

/// Binds both ports, drops privileges and serves until a listener fails.
///
/// A `detached` instance tells its parent once everything is set up.
async fn serve(config: Config, resourcedir: &Path, detached: bool) -> Result<(), Error> {
    let store = Arc::new(MailStore::new());

    let smtp_addr = config.smtp_bind_address();
    let smtp_listener = bind(&smtp_addr, config.smtp_grace_period()).await?;

    log::info!("Loading resources from {}", resourcedir.display());
    let resources = Resources::open(resourcedir, config.static_dev)?;
    let view = Arc::new(MailView::new(
        store.clone(),
        resources,
        config.static_cache_secs,
    ));
    let http_listener = TcpListener::bind(config.http_bind_address()).await?;

    if config.workarounds {
        // Zone data is not reachable from inside a chroot.
        utils::local_zone();
    }

    let pidfile = match &config.chroot {
        Some(_) => config.pidfile.clone(),
        None => config.effective_pidfile(),
    };
    process::drop_privileges(&config, || match &pidfile {
        Some(path) => process::write_pidfile(path),
        None => Ok(()),
    })?;
    if detached {
        process::notify_ready()?;
    }

    let handler = Arc::new(CaptureHandler::new(store));
    tokio::try_join!(
        run_smtp_server(smtp_listener, handler, config.max_message_size),
        run_http_server(http_listener, view),
    )
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(())
}
