//! Launch description for one agent process.

/// Everything needed to exec an agent. The command line carries the
/// per-session configuration; the environment carries secrets and
/// connection URLs.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Session id — also the media room the agent will join.
    pub session_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

impl AgentCommand {
    pub fn new(session_id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            workdir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}
