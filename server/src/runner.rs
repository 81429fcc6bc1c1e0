use std::{borrow::Cow, io, process::Command};

/// Combined stdout/stderr of a finished subprocess, plus whether it exited
/// cleanly. Callers that care about the distinction between "ran and failed"
/// and "couldn't run at all" get the latter as an `io::Error`.
pub struct CommandOutput {
    pub success: bool,
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// Seam for every external binary the daemon drives (`iptables`, `ipset`,
/// `ip`, `sysctl`). Tests substitute a scripted implementation.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let out = Command::new(program).args(args).output()?;
        let mut output = out.stdout;
        output.extend_from_slice(&out.stderr);
        Ok(CommandOutput {
            success: out.status.success(),
            output,
        })
    }
}
