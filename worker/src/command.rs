use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::process::Command;

use crate::error::ToolRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Program plus argument vector, executed directly.
    Argv { program: String, args: Vec<String> },
    /// A full command line executed through `sh -c`.
    Shell(String),
}

/// One concrete external command plus how its streams are captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub role: ToolRole,
    pub line: CommandLine,
    pub capture_stdout: bool,
}

impl CommandInvocation {
    pub fn argv(role: ToolRole, program: impl Into<String>) -> Self {
        CommandInvocation {
            role,
            line: CommandLine::Argv {
                program: program.into(),
                args: Vec::new(),
            },
            capture_stdout: false,
        }
    }

    pub fn shell(role: ToolRole, line: impl Into<String>) -> Self {
        CommandInvocation {
            role,
            line: CommandLine::Shell(line.into()),
            capture_stdout: false,
        }
    }

    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    /// Appends one argument. No-op for shell invocations.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        if let CommandLine::Argv { args, .. } = &mut self.line {
            args.push(arg.as_ref().to_string_lossy().into_owned());
        }
        self
    }

    pub fn args<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for item in items {
            self = self.arg(item);
        }
        self
    }

    pub fn arg_list(&self) -> &[String] {
        match &self.line {
            CommandLine::Argv { args, .. } => args,
            CommandLine::Shell(_) => &[],
        }
    }

    /// Value following `flag` in the argument vector, if any.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let args = self.arg_list();
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    pub fn to_command(&self) -> Command {
        match &self.line {
            CommandLine::Argv { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            CommandLine::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.line {
            CommandLine::Argv { program, args } => {
                f.write_str(&shell_quote(program))?;
                for arg in args {
                    write!(f, " {}", shell_quote(arg))?;
                }
                Ok(())
            }
            CommandLine::Shell(line) => f.write_str(line),
        }
    }
}

/// Single-quotes `value` for a POSIX shell unless it is made of safe characters only.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,%+@".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

pub fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}
