//! Child-process supervision with bounded waits.
//!
//! The orchestrator runs API instances and the proxy as separate OS
//! processes. Shutdown asks each child to exit via SIGTERM and falls back
//! to a hard kill once the grace period expires, so a wedged child can
//! never hang the parent.

use std::io;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Outcome of a graceful child shutdown.
#[derive(Debug)]
pub enum ShutdownOutcome {
    /// Child exited on its own within the grace period.
    Graceful(std::process::ExitStatus),
    /// Child ignored the termination request and was killed.
    Forced,
    /// Waiting on the child failed; a kill was attempted regardless.
    Error(io::Error),
}

impl ShutdownOutcome {
    pub fn was_graceful(&self) -> bool {
        matches!(self, ShutdownOutcome::Graceful(_))
    }
}

/// Spawn a supervised child inheriting stdout/stderr, with extra
/// environment variables applied on top of the parent's.
pub fn spawn_supervised(
    program: &str,
    args: &[&str],
    envs: &[(&str, String)],
) -> io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let child = cmd.spawn()?;
    debug!(program, pid = child.id(), "spawned child");
    Ok(child)
}

/// Ask a child to terminate (SIGTERM on unix) without waiting.
///
/// On platforms without POSIX signals there is no polite request to
/// deliver; the caller's grace period degrades to an immediate kill.
pub fn request_termination(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(pid = child.id(), error = %e, "failed to deliver SIGTERM");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

/// Request termination, wait up to `grace`, then force-kill.
///
/// Always reaps the child so no zombie is left behind.
pub fn shutdown_child(child: &mut Child, grace: Duration) -> ShutdownOutcome {
    request_termination(child);

    match child.wait_timeout(grace) {
        Ok(Some(status)) => ShutdownOutcome::Graceful(status),
        Ok(None) => {
            warn!(
                pid = child.id(),
                grace_secs = grace.as_secs_f64(),
                "child ignored termination request, killing"
            );
            let _ = child.kill();
            let _ = child.wait();
            ShutdownOutcome::Forced
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            ShutdownOutcome::Error(e)
        }
    }
}
