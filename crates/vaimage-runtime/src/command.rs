use std::fmt;
use std::path::{Path, PathBuf};

/// Where a tool runs: directly on the host, or inside `chroot <root>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    Host,
    Chroot(PathBuf),
}

impl CommandTarget {
    pub fn for_flag(chroot: bool, root: &Path) -> Self {
        if chroot {
            Self::Chroot(root.to_path_buf())
        } else {
            Self::Host
        }
    }
}

/// One invocation of an external utility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub target: CommandTarget,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            target: CommandTarget::Host,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn path_arg(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn target(mut self, target: CommandTarget) -> Self {
        self.target = target;
        self
    }

    /// The binary actually spawned: `chroot` for chrooted commands.
    pub fn executable(&self) -> &str {
        match self.target {
            CommandTarget::Host => &self.program,
            CommandTarget::Chroot(_) => "chroot",
        }
    }

    /// Full argument vector, excluding the executable.
    pub fn argv(&self) -> Vec<String> {
        match &self.target {
            CommandTarget::Host => self.args.clone(),
            CommandTarget::Chroot(root) => {
                let mut argv = Vec::with_capacity(self.args.len() + 2);
                argv.push(root.to_string_lossy().into_owned());
                argv.push(self.program.clone());
                argv.extend(self.args.iter().cloned());
                argv
            }
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.executable())?;
        for arg in self.argv() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_owned(),
            (true, false) => stderr.to_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}
