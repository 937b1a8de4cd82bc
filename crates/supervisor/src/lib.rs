//! Process Supervisor — launches voice agents as process-group leaders,
//! captures their output, and kills the whole group on demand.
//!
//! Every agent is spawned with `process_group(0)`, making it the leader
//! of a fresh group (`pgid == pid`). All signalling targets the *group*:
//! signalling the single pid would orphan descendants such as audio
//! helper processes.

mod command;
mod handle;
mod ring_log;
mod spawn;

pub use command::AgentCommand;
pub use handle::{
    alive_group, terminate_group, AgentHandle, ExitInfo, OutputChannel, OutputLine,
};
pub use ring_log::RingLogs;
pub use spawn::{LogSink, Supervisor};
