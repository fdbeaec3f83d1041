use indexmap::IndexMap;
use jsh_types::ExitStatus;
use nix::unistd::Pid;
use std::fmt;

use super::redirect::Redirect;
use super::state::ProcessState;

/// One stage of a pipeline.
///
/// Built by the caller, then owned by its [`Job`](super::Job); only the job
/// and the reaper change `pid` and `state` afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub(crate) path: String,
    pub(crate) args: Vec<String>,
    pub(crate) environ: IndexMap<String, String>,
    pub(crate) redirects: Vec<Redirect>,
    pub(crate) pid: Option<Pid>,
    pub(crate) state: ProcessState,
}

impl Process {
    pub fn new(path: impl Into<String>) -> Self {
        Process {
            path: path.into(),
            args: Vec::new(),
            environ: IndexMap::new(),
            redirects: Vec::new(),
            pid: None,
            state: ProcessState::Created,
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

    /// Set one variable; a later value for the same key replaces the earlier one.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environ.insert(key.into(), value.into());
        self
    }

    pub fn environ<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.environ.insert(key.into(), value.into());
        }
        self
    }

    /// Copy the calling process's environment.
    pub fn inherit_env(self) -> Self {
        self.environ(std::env::vars())
    }

    pub fn redirect(mut self, redirect: Redirect) -> Self {
        self.redirects.push(redirect);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_environ(&self) -> &IndexMap<String, String> {
        &self.environ
    }

    pub fn get_redirects(&self) -> &[Redirect] {
        &self.redirects
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.state {
            ProcessState::Terminated(status) => Some(status),
            _ => None,
        }
    }

    /// Record a transition. Returns false when nothing changed.
    pub(crate) fn set_state(&mut self, state: ProcessState) -> bool {
        if self.state == state || self.state.is_terminated() {
            return false;
        }
        self.state = state;
        true
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.path)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        for redirect in &self.redirects {
            write!(f, " {redirect}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn init() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    #[test]
    fn test_process_state_transitions() {
        init();
        let mut process = Process::new("test_cmd").arg("arg1");
        assert_eq!(process.state(), ProcessState::Created);

        assert!(process.set_state(ProcessState::Running));
        assert!(!process.set_state(ProcessState::Running));
        assert!(process.set_state(ProcessState::Stopped(Signal::SIGTSTP)));
        assert!(process.set_state(ProcessState::Running));
        assert!(process.set_state(ProcessState::Terminated(ExitStatus::Exited(0))));
        assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));

        // terminal state
        assert!(!process.set_state(ProcessState::Running));
        assert!(process.state().is_terminated());
    }

    #[test]
    fn environ_keys_are_unique() {
        let process = Process::new("env")
            .env("A", "1")
            .env("B", "2")
            .env("A", "3");
        let keys: Vec<&str> = process.get_environ().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(process.get_environ()["A"], "3");
    }

    #[test]
    fn display_joins_args_and_redirects() {
        let process = Process::new("grep")
            .args(["-n", "foo"])
            .redirect(Redirect::duplicate(2, 1));
        assert_eq!(process.to_string(), "grep -n foo 2>&1");
    }
}
