//! Agent launch and output pumping.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, Notify};

use crate::command::AgentCommand;
use crate::handle::{AgentHandle, ExitInfo, OutputChannel, OutputLine, Shared};
use crate::ring_log::RingLogs;

/// Capacity of the per-agent output broadcast. Watchers that lag past
/// this see `Lagged`, never a blocked pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Optional durable mirror for agent output lines (the gateway wires
/// this to the shared store's capped log list). Best-effort: errors are
/// the sink's problem, the pump never fails on them.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, session_id: &str, channel: OutputChannel, line: &str);
}

/// Launches agents and owns their ring logs.
pub struct Supervisor {
    ring_logs: Arc<RingLogs>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Supervisor {
    pub fn new(sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            ring_logs: Arc::new(RingLogs::new()),
            sink,
        }
    }

    pub fn ring_logs(&self) -> &Arc<RingLogs> {
        &self.ring_logs
    }

    /// Spawn an agent as the leader of a fresh process group and start
    /// pumping its output.
    ///
    /// The returned handle's pid *is* the pgid. The monitor task reaps
    /// the child and records its exit after both output pumps have
    /// drained, so a reaped exit implies the ring log is complete.
    pub fn launch(&self, cmd: AgentCommand) -> sb_domain::Result<AgentHandle> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Fresh process group, agent as leader: the whole descendant
            // tree is signalable as one unit.
            .process_group(0);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if let Some(ref dir) = cmd.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| sb_domain::Error::Internal("spawned child has no pid".into()))?
            as i32;

        let (output_tx, initial_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            exit: Mutex::new(None),
            exit_notify: Notify::new(),
            output_tx: output_tx.clone(),
            initial_rx: Mutex::new(Some(initial_rx)),
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let session_id = cmd.session_id.clone();

        let out_pump = pump(
            session_id.clone(),
            OutputChannel::Out,
            stdout,
            output_tx.clone(),
            self.ring_logs.clone(),
            self.sink.clone(),
        );
        let err_pump = pump(
            session_id.clone(),
            OutputChannel::Err,
            stderr,
            output_tx,
            self.ring_logs.clone(),
            self.sink.clone(),
        );

        // Monitor: reap the child, then record the exit. Pumps are
        // awaited first so exit implies complete output capture.
        let monitor_shared = shared.clone();
        let monitor_session = session_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = out_pump.await;
            let _ = err_pump.await;

            let info = match status {
                Ok(status) => exit_info_from(status),
                Err(e) => {
                    tracing::warn!(session_id = %monitor_session, error = %e, "agent wait failed");
                    ExitInfo::Code(-1)
                }
            };
            *monitor_shared.exit.lock() = Some(info);
            monitor_shared.exit_notify.notify_waiters();
            tracing::debug!(session_id = %monitor_session, %info, "agent reaped");
        });

        tracing::info!(session_id = %cmd.session_id, pid, "agent launched");
        Ok(AgentHandle::new(cmd.session_id, pid, shared))
    }
}

fn exit_info_from(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitInfo::Code(code),
        None => ExitInfo::Signal(status.signal().unwrap_or(0)),
    }
}

/// Read one stdio stream line-by-line into the ring log, the durable
/// sink, and the watcher broadcast. Never blocks on watchers.
fn pump(
    session_id: String,
    channel: OutputChannel,
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    output_tx: broadcast::Sender<OutputLine>,
    ring_logs: Arc<RingLogs>,
    sink: Option<Arc<dyn LogSink>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            match channel {
                OutputChannel::Out => ring_logs.push(&session_id, &line),
                OutputChannel::Err => ring_logs.push(&session_id, &format!("[stderr] {line}")),
            }
            if let Some(ref sink) = sink {
                sink.append(&session_id, channel, &line).await;
            }
            // No receivers is fine — lines still land in the ring log.
            let _ = output_tx.send(OutputLine {
                channel,
                line,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::handle::alive_group;

    fn sh(session_id: &str, script: &str) -> AgentCommand {
        AgentCommand::new(session_id, "/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let sup = Supervisor::new(None);
        let handle = sup
            .launch(sh("t-out", "echo ready; echo oops 1>&2; exit 3"))
            .unwrap();

        let exit = handle.wait_exited(Duration::from_secs(5)).await;
        assert_eq!(exit, Some(ExitInfo::Code(3)));

        let lines = sup.ring_logs().recent("t-out");
        assert!(lines.iter().any(|l| l == "ready"));
        assert!(lines.iter().any(|l| l == "[stderr] oops"));
    }

    #[tokio::test]
    async fn agent_is_its_own_group_leader() {
        let sup = Supervisor::new(None);
        let handle = sup.launch(sh("t-pgid", "sleep 20")).unwrap();

        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(handle.pid()))).unwrap();
        assert_eq!(pgid.as_raw(), handle.pid());
        assert_eq!(handle.pgid(), handle.pid());
        assert!(handle.alive());

        handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!handle.alive());
    }

    #[tokio::test]
    async fn terminate_kills_the_whole_group() {
        let sup = Supervisor::new(None);
        // The shell forks a background child into the same group.
        let handle = sup
            .launch(sh("t-group", "sleep 30 & sleep 30"))
            .unwrap();
        assert!(handle.alive());

        handle.terminate(Duration::from_millis(500)).await.unwrap();
        assert!(!alive_group(handle.pgid()));
    }

    #[tokio::test]
    async fn sigterm_immune_agent_is_force_killed() {
        let sup = Supervisor::new(None);
        let handle = sup
            .launch(sh("t-stubborn", "trap '' TERM; sleep 30"))
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.terminate(Duration::from_millis(300)).await.unwrap();
        let exit = handle.wait_exited(Duration::from_secs(5)).await;
        assert_eq!(exit, Some(ExitInfo::Signal(libc_sigkill())));
        assert!(!handle.alive());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let sup = Supervisor::new(None);
        let handle = sup.launch(sh("t-idem", "sleep 30")).unwrap();

        handle.terminate(Duration::from_millis(200)).await.unwrap();
        // Second call is a no-op on an already-dead group.
        handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!handle.alive());
    }

    #[tokio::test]
    async fn terminate_group_works_from_a_bare_pgid() {
        let sup = Supervisor::new(None);
        let handle = sup.launch(sh("t-bare", "sleep 30")).unwrap();
        let pgid = handle.pgid();

        // Simulates post-restart teardown: only the persisted pgid.
        crate::handle::terminate_group(pgid, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!alive_group(pgid));

        // A second call on the dead group is still fine.
        crate::handle::terminate_group(pgid, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_watcher_sees_lines_from_exec() {
        let sup = Supervisor::new(None);
        let handle = sup.launch(sh("t-watch", "echo marker-line")).unwrap();

        let mut rx = handle.take_output();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("line before deadline")
            .expect("channel open");
        assert_eq!(line.line, "marker-line");
        assert_eq!(line.channel, OutputChannel::Out);
    }

    fn libc_sigkill() -> i32 {
        nix::sys::signal::Signal::SIGKILL as i32
    }
}
