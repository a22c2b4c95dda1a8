//! Scripted stand-ins for [`Executor`] and [`Host`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::exec::command_line;
use crate::{Executor, Host, IscsiError, MountPoint};

#[derive(Debug, Clone)]
enum Reply {
    Ok(String),
    Fail(String),
    Timeout,
}

/// Replies are matched on the full command line. Queued replies are consumed
/// in order and the last one repeats; unscripted commands succeed silently.
#[derive(Debug, Default)]
pub(crate) struct FakeExec {
    replies: RefCell<HashMap<String, VecDeque<Reply>>>,
    calls: RefCell<Vec<(String, Option<Duration>)>>,
}

impl FakeExec {
    pub(crate) fn new() -> Self {
        FakeExec::default()
    }

    pub(crate) fn reply(self, cmd: &str, out: &str) -> Self {
        self.push(cmd, Reply::Ok(out.to_string()))
    }

    pub(crate) fn fail(self, cmd: &str, out: &str) -> Self {
        self.push(cmd, Reply::Fail(out.to_string()))
    }

    /// The command runs past its deadline.
    pub(crate) fn time_out(self, cmd: &str) -> Self {
        self.push(cmd, Reply::Timeout)
    }

    fn push(self, cmd: &str, reply: Reply) -> Self {
        self.replies
            .borrow_mut()
            .entry(cmd.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(cmd, _)| cmd.clone()).collect()
    }

    pub(crate) fn timeouts(&self, prefix: &str) -> Vec<Option<Duration>> {
        self.calls
            .borrow()
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(prefix))
            .map(|(_, timeout)| *timeout)
            .collect()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(prefix))
            .count()
    }
}

impl Executor for FakeExec {
    fn run_timeout(&self, name: &str, args: &[&str], timeout: Option<Duration>) -> Result<String> {
        let cmd = command_line(name, args);
        self.calls.borrow_mut().push((cmd.clone(), timeout));

        let reply = {
            let mut replies = self.replies.borrow_mut();
            match replies.get_mut(&cmd) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            None => Ok(String::new()),
            Some(Reply::Ok(out)) => Ok(out),
            Some(Reply::Fail(output)) => anyhow::bail!(IscsiError::CommandFailed { cmd, output }),
            Some(Reply::Timeout) => anyhow::bail!(IscsiError::CommandTimeout {
                cmd,
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    /// path -> number of probes that still report it missing
    links: RefCell<HashMap<PathBuf, usize>>,
    probes: RefCell<Vec<PathBuf>>,
    dirs: HashMap<PathBuf, Vec<String>>,
    writes: RefCell<Vec<(PathBuf, String)>>,
    broken_files: Vec<PathBuf>,
    mounts: Option<Vec<MountPoint>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        FakeHost {
            mounts: Some(Vec::new()),
            ..Default::default()
        }
    }

    pub(crate) fn link<P: AsRef<Path>>(self, path: P) -> Self {
        self.link_after(path, 0)
    }

    /// The link shows up on probe number `misses + 1`.
    pub(crate) fn link_after<P: AsRef<Path>>(self, path: P, misses: usize) -> Self {
        self.links
            .borrow_mut()
            .insert(path.as_ref().to_path_buf(), misses);
        self
    }

    pub(crate) fn dir<P: AsRef<Path>>(mut self, path: P, names: &[&str]) -> Self {
        self.dirs.insert(
            path.as_ref().to_path_buf(),
            names.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub(crate) fn broken_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.broken_files.push(path.as_ref().to_path_buf());
        self
    }

    pub(crate) fn mount(mut self, device: &str, path: &str) -> Self {
        self.mounts.get_or_insert_with(Vec::new).push(MountPoint {
            device: device.to_string(),
            path: path.to_string(),
        });
        self
    }

    pub(crate) fn no_mount_table(mut self) -> Self {
        self.mounts = None;
        self
    }

    pub(crate) fn probes<P: AsRef<Path>>(&self, path: P) -> usize {
        self.probes
            .borrow()
            .iter()
            .filter(|p| p.as_path() == path.as_ref())
            .count()
    }

    pub(crate) fn writes(&self) -> Vec<(PathBuf, String)> {
        self.writes.borrow().clone()
    }
}

impl Host for FakeHost {
    fn exists(&self, path: &Path) -> bool {
        self.probes.borrow_mut().push(path.to_path_buf());
        match self.links.borrow_mut().get_mut(path) {
            Some(0) => true,
            Some(misses) => {
                *misses -= 1;
                false
            }
            None => false,
        }
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        self.dirs.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())
        })
    }

    fn echo(&self, path: &Path, content: &str) -> Result<()> {
        if self.broken_files.iter().any(|p| p == path) {
            anyhow::bail!(IscsiError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                path.display().to_string(),
            )));
        }
        self.writes
            .borrow_mut()
            .push((path.to_path_buf(), content.to_string()));
        Ok(())
    }

    fn mounts(&self) -> Result<Vec<MountPoint>> {
        match &self.mounts {
            Some(mounts) => Ok(mounts.clone()),
            None => anyhow::bail!("mount table unavailable"),
        }
    }
}
