//! Live handle to a running agent process group.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Out,
    Err,
}

/// One line of agent output. Lines arrive in the order the OS buffered
/// them; relative ordering *between* the two channels is not guaranteed.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub channel: OutputChannel,
    pub line: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exit info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    Code(i32),
    /// Killed by the given signal number.
    Signal(i32),
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitInfo::Code(c) => write!(f, "exit code {c}"),
            ExitInfo::Signal(s) => write!(f, "killed by signal {s}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct Shared {
    pub(crate) exit: Mutex<Option<ExitInfo>>,
    pub(crate) exit_notify: Notify,
    pub(crate) output_tx: broadcast::Sender<OutputLine>,
    /// Receiver created before the output pumps start, so the first
    /// watcher cannot miss lines emitted right after exec.
    pub(crate) initial_rx: Mutex<Option<broadcast::Receiver<OutputLine>>>,
}

/// Handle to one agent. Cloneable; all clones observe the same process.
///
/// The monitor task owns the `Child` and reaps it; the handle interacts
/// with the process purely through group signals, so it keeps working
/// for as long as the pgid is meaningful.
#[derive(Clone)]
pub struct AgentHandle {
    session_id: String,
    pid: i32,
    shared: Arc<Shared>,
    terminate_started: Arc<AtomicBool>,
}

impl AgentHandle {
    pub(crate) fn new(session_id: String, pid: i32, shared: Arc<Shared>) -> Self {
        Self {
            session_id,
            pid,
            shared,
            terminate_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Equal to the pid by construction — the agent is its own group
    /// leader.
    pub fn pgid(&self) -> i32 {
        self.pid
    }

    /// Watch agent output. The channel is lossy for slow receivers
    /// (`Lagged`), which keeps the output pump from ever blocking on a
    /// watcher — a blocked pump would fill the agent's pipe and wedge
    /// its stdio.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.shared.output_tx.subscribe()
    }

    /// The pre-subscribed receiver, armed before the pumps started: the
    /// first taker observes every line from exec onward. Later takers
    /// fall back to [`subscribe`](Self::subscribe).
    pub fn take_output(&self) -> broadcast::Receiver<OutputLine> {
        self.shared
            .initial_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.shared.output_tx.subscribe())
    }

    /// True iff the process group still has a member.
    pub fn alive(&self) -> bool {
        alive_group(self.pgid())
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.shared.exit.lock()
    }

    /// Wait up to `timeout` for the agent process to be reaped.
    pub async fn wait_exited(&self, timeout: Duration) -> Option<ExitInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(info) = self.exit_info() {
                return Some(info);
            }
            let notified = self.shared.exit_notify.notified();
            // Re-check after arming the waiter: the monitor may have
            // recorded the exit between the check and the arm.
            if let Some(info) = self.exit_info() {
                return Some(info);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.exit_info();
            }
        }
    }

    /// Politely terminate the whole group, then force-kill whatever is
    /// left after `grace`. Idempotent: repeated calls are no-ops. A
    /// group that is already gone counts as success.
    pub async fn terminate(&self, grace: Duration) -> sb_domain::Result<()> {
        if self.terminate_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(
            session_id = %self.session_id,
            pgid = self.pgid(),
            "terminating agent process group"
        );
        send_group(self.pgid(), Signal::SIGTERM)?;
        let _ = self.wait_exited(grace).await;
        if alive_group(self.pgid()) {
            tracing::warn!(
                session_id = %self.session_id,
                pgid = self.pgid(),
                "agent survived grace period, force-killing group"
            );
            send_group(self.pgid(), Signal::SIGKILL)?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Group signalling (also usable with only a persisted pgid)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Signal-0 probe: does the group still have a member?
pub fn alive_group(pgid: i32) -> bool {
    signal::killpg(Pid::from_raw(pgid), None).is_ok()
}

/// Terminate a process group given only its pgid — used to tear down
/// agents inherited from a previous orchestrator run, where no handle
/// exists but pid/pgid were persisted before readiness.
pub async fn terminate_group(pgid: i32, grace: Duration) -> sb_domain::Result<()> {
    if !alive_group(pgid) {
        return Ok(());
    }
    send_group(pgid, Signal::SIGTERM)?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !alive_group(pgid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if alive_group(pgid) {
        send_group(pgid, Signal::SIGKILL)?;
    }
    Ok(())
}

/// `killpg` with ESRCH mapped to success — "no such process" means the
/// group is already gone, which is the state we wanted.
fn send_group(pgid: i32, sig: Signal) -> sb_domain::Result<()> {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(sb_domain::Error::SignalFailed(format!(
            "killpg({pgid}, {sig}): {e}"
        ))),
    }
}
