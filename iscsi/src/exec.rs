use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::IscsiError;

/// Poll interval while waiting on a command that has a deadline.
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Runs external tools such as `iscsiadm` and `lsblk`.
///
/// Both methods return the combined stdout and stderr of the command and fail
/// with [`IscsiError::CommandFailed`] on a non-zero exit. The output is not
/// interleaved: all of stdout comes first, then all of stderr.
pub trait Executor {
    fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        self.run_timeout(name, args, None)
    }

    /// Like [`Executor::run`], but kills the command once `timeout` elapses.
    fn run_timeout(&self, name: &str, args: &[&str], timeout: Option<Duration>) -> Result<String>;
}

/// [`Executor`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Exec;

impl Executor for Exec {
    fn run_timeout(&self, name: &str, args: &[&str], timeout: Option<Duration>) -> Result<String> {
        let cmd = command_line(name, args);
        log::trace!("[exec] {}", cmd);

        let mut child = Command::new(name)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || drain(stdout));
        let err_reader = thread::spawn(move || drain(stderr));

        let status = match timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        // the child may have exited between try_wait and kill
                        let _ = child.kill();
                        let _ = child.wait();
                        log::trace!("[exec] {} killed after {:?}", cmd, timeout);
                        anyhow::bail!(IscsiError::CommandTimeout { cmd, timeout });
                    }
                    thread::sleep(WAIT_INTERVAL);
                }
            }
        };

        let mut output = out_reader.join().unwrap_or_default();
        output.extend(err_reader.join().unwrap_or_default());
        let output = String::from_utf8_lossy(&output).to_string();
        log::trace!("[exec] output ==>\n{}", output);

        if !status.success() {
            anyhow::bail!(IscsiError::CommandFailed {
                cmd,
                output: format!("{} ({})", output.trim_end(), status),
            });
        }

        Ok(output)
    }
}

pub(crate) fn command_line(name: &str, args: &[&str]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn drain<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}
