//! Pid file handling, daemonizing and dropping privileges.

use crate::config::{Config, Principal};
use crate::error::Error;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Gid, Group, Pid, Uid, User};
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::{Command, Stdio};

const PROCESS_NAME: &[u8] = b"mockmail";

/// Returns the pid recorded in `path` if it belongs to a running mockmail.
///
/// Missing, unparsable and stale pid files all yield `None`.
pub fn read_pid(path: &Path) -> Result<Option<i32>, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        log::debug!("Ignoring unparsable pid file {}", path.display());
        return Ok(None);
    };
    Ok((pid > 0 && is_mockmail(pid)).then_some(pid))
}

#[cfg(target_os = "linux")]
fn is_mockmail(pid: i32) -> bool {
    fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|cmdline| {
        cmdline
            .windows(PROCESS_NAME.len())
            .any(|window| window == PROCESS_NAME)
    })
}

#[cfg(not(target_os = "linux"))]
fn is_mockmail(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

pub fn write_pidfile(path: &Path) -> Result<(), Error> {
    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Terminates the instance recorded in `path` and removes the pid file.
///
/// Returns the pid that was signalled, if any.
pub fn stop(path: &Path) -> Result<Option<i32>, Error> {
    let pid = read_pid(path)?;
    if let Some(pid) = pid {
        log::debug!("Sending SIGTERM to {pid}");
        kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    Ok(pid)
}

/// Line a background instance writes to its stdout once it serves.
const READY: &str = "ready";

/// Starts the current executable again in the background with `args`.
///
/// The child gets `--detached` appended. Returns its pid once it reported
/// readiness with [`notify_ready`].
pub fn spawn_detached(args: impl IntoIterator<Item = OsString>) -> Result<u32, Error> {
    let mut command = Command::new(std::env::current_exe()?);
    command.args(args).arg("--detached");
    start_background(command)
}

fn start_background(mut command: Command) -> Result<u32, Error> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::StartFailed("no pipe to the background process".to_string()))?;

    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line)?;
    match line.trim_end() {
        READY => Ok(child.id()),
        report => {
            let status = child.wait()?;
            log::debug!("Background process {} ended with {status}", child.id());
            Err(Error::StartFailed(match report {
                "" => format!("exited with {status}"),
                report => report.to_string(),
            }))
        }
    }
}

/// Tells the parent waiting in [`spawn_detached`] that startup succeeded.
pub fn notify_ready() -> Result<(), Error> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{READY}")?;
    stdout.flush()?;
    Ok(())
}

/// Hands a fatal error of a background instance to the waiting parent.
pub fn notify_failure(error: &Error) {
    let mut stdout = std::io::stdout();
    if let Err(e) = writeln!(stdout, "{error}").and_then(|()| stdout.flush()) {
        log::debug!("Could not report failure to the parent: {e}");
    }
}

/// Leaves the controlling terminal's session.
pub fn detach() -> Result<(), Error> {
    nix::unistd::setsid()?;
    Ok(())
}

fn resolve_user(principal: &Principal) -> Result<User, Error> {
    let user = match principal {
        Principal::Name(name) => User::from_name(name)?,
        Principal::Id(uid) => User::from_uid(Uid::from_raw(*uid))?,
    };
    user.ok_or_else(|| Error::UnknownUser(display(principal)))
}

fn resolve_group(principal: &Principal) -> Result<Gid, Error> {
    let group = match principal {
        Principal::Name(name) => Group::from_name(name)?,
        Principal::Id(gid) => Group::from_gid(Gid::from_raw(*gid))?,
    };
    group
        .map(|group| group.gid)
        .ok_or_else(|| Error::UnknownGroup(display(principal)))
}

fn display(principal: &Principal) -> String {
    match principal {
        Principal::Name(name) => name.clone(),
        Principal::Id(id) => id.to_string(),
    }
}

/// Enters the configured chroot and switches to the configured user and group.
///
/// `in_root` runs after the chroot but while still privileged, so it can
/// create files such as the pid file.
pub fn drop_privileges<F>(config: &Config, in_root: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<(), Error>,
{
    // The user database is usually unreachable from inside the chroot.
    let user = config.dropuser.as_ref().map(resolve_user).transpose()?;
    let gid = match &config.dropgroup {
        Some(group) => Some(resolve_group(group)?),
        None => user.as_ref().map(|user| user.gid),
    };

    if let Some(root) = &config.chroot {
        if config.chroot_mkdir && !root.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(root)?;
        }
        nix::unistd::chroot(root)?;
        nix::unistd::chdir("/")?;
        log::info!("Changed root to {}", root.display());
    }

    in_root()?;

    if let Some(gid) = gid {
        nix::unistd::setgroups(&[])?;
        nix::unistd::setgid(gid)?;
        log::info!("Dropped to group {gid}");
    }
    if let Some(user) = user {
        nix::unistd::setuid(user.uid)?;
        log::info!("Dropped to user {} ({})", user.name, user.uid);
    }
    Ok(())
}
