//! Daemon lifecycle: pidfiles, double-fork, SIGTERM.
//!
//! A service started with `--start` detaches via the classic double fork;
//! the supervisor pid lands in the `.master.` pidfile and each service
//! process writes `<stem>.<i>.<ext>`. `--stop` SIGTERMs every pid the
//! layout finds, falling back to the master pid when no numbered files
//! remain. The layout is a plain struct so tests can point it at a
//! temporary directory.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, setsid, ForkResult, Pid};

/// What to do with the daemon before running the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonCommand {
    /// Run in the foreground.
    #[default]
    None,
    Start,
    Stop,
    Restart,
}

impl std::str::FromStr for DaemonCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(DaemonCommand::None),
            "start" => Ok(DaemonCommand::Start),
            "stop" => Ok(DaemonCommand::Stop),
            "restart" => Ok(DaemonCommand::Restart),
            other => Err(format!("invalid daemon command: {other}")),
        }
    }
}

/// Pidfile naming: `<stem>.<i>.<ext>` per process plus `<stem>.master.<ext>`
/// for the supervisor.
#[derive(Debug, Clone)]
pub struct PidfileLayout {
    base: PathBuf,
}

impl PidfileLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        PidfileLayout { base: base.into() }
    }

    fn with_id(&self, id: &str) -> PathBuf {
        let stem = self
            .base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("toto");
        let name = match self.base.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{stem}.{id}.{ext}"),
            None => format!("{stem}.{id}"),
        };
        self.base.with_file_name(name)
    }

    pub fn numbered(&self, index: usize) -> PathBuf {
        self.with_id(&index.to_string())
    }

    pub fn master(&self) -> PathBuf {
        self.with_id("master")
    }

    fn directory(&self) -> &Path {
        let parent = self.base.parent();
        match parent {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn matches(&self, name: &str) -> bool {
        let stem = self
            .base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("toto");
        let Some(rest) = name.strip_prefix(&format!("{stem}.")) else {
            return false;
        };
        let id = match self.base.extension().and_then(|e| e.to_str()) {
            Some(ext) => match rest.strip_suffix(&format!(".{ext}")) {
                Some(id) => id,
                None => return false,
            },
            None => rest,
        };
        id == "master" || id.chars().all(|c| c.is_ascii_digit())
    }

    /// Every pidfile of this layout currently on disk, with its pid.
    pub fn scan(&self) -> io::Result<Vec<(PathBuf, i32)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(self.directory())? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !self.matches(&name) {
                continue;
            }
            let path = entry.path();
            if let Some(pid) = read_pid(&path) {
                found.push((path, pid));
            }
        }
        Ok(found)
    }

    pub fn write(&self, path: &Path, pid: u32) -> io::Result<()> {
        std::fs::write(path, pid.to_string())
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Which process this is after daemonization.
pub enum DaemonRole {
    /// The original foreground process; it should exit.
    Launcher,
    /// The detached service process.
    Service,
}

/// Detach from the terminal with a double fork. The intermediate child
/// writes the final pid to the master pidfile and exits; the caller
/// continues as either the launcher or the detached service.
pub fn daemonize(layout: &PidfileLayout) -> io::Result<DaemonRole> {
    match unsafe { fork() }.map_err(io::Error::other)? {
        ForkResult::Parent { .. } => return Ok(DaemonRole::Launcher),
        ForkResult::Child => {}
    }
    setsid().map_err(io::Error::other)?;
    match unsafe { fork() }.map_err(io::Error::other)? {
        ForkResult::Parent { child } => {
            layout.write(&layout.master(), child.as_raw() as u32)?;
            std::process::exit(0);
        }
        ForkResult::Child => Ok(DaemonRole::Service),
    }
}

/// True when any pidfile of this layout exists; starting must refuse then.
pub fn already_running(layout: &PidfileLayout) -> io::Result<bool> {
    Ok(!layout.scan()?.is_empty())
}

/// SIGTERM every process the layout knows about and remove the pidfiles.
/// Dead pids (ESRCH) are cleaned up silently.
pub fn stop(layout: &PidfileLayout) -> io::Result<()> {
    for (path, pid) in layout.scan()? {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => log::info!("stopped process {pid}"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(io::Error::other(e)),
        }
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_in_temp() -> (PidfileLayout, PathBuf) {
        let dir = std::env::temp_dir().join(format!("toto-pids-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        (PidfileLayout::new(dir.join("toto.pid")), dir)
    }

    #[test]
    fn pidfile_names_insert_the_id() {
        let layout = PidfileLayout::new("/var/run/toto.pid");
        assert_eq!(layout.numbered(0), Path::new("/var/run/toto.0.pid"));
        assert_eq!(layout.numbered(12), Path::new("/var/run/toto.12.pid"));
        assert_eq!(layout.master(), Path::new("/var/run/toto.master.pid"));
    }

    #[test]
    fn names_without_extension_still_work() {
        let layout = PidfileLayout::new("/var/run/totod");
        assert_eq!(layout.numbered(1), Path::new("/var/run/totod.1"));
        assert_eq!(layout.master(), Path::new("/var/run/totod.master"));
    }

    #[test]
    fn scan_finds_only_matching_pidfiles() {
        let (layout, dir) = layout_in_temp();
        layout.write(&layout.numbered(0), 100).unwrap();
        layout.write(&layout.master(), 101).unwrap();
        std::fs::write(dir.join("other.pid"), "102").unwrap();
        std::fs::write(dir.join("toto.notanumber.pid"), "103").unwrap();

        let mut pids: Vec<i32> = layout.scan().unwrap().into_iter().map(|(_, p)| p).collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 101]);
        assert!(already_running(&layout).unwrap());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn stop_removes_stale_pidfiles() {
        let (layout, dir) = layout_in_temp();
        // A pid that certainly is not running.
        layout.write(&layout.numbered(0), (i32::MAX - 1) as u32).unwrap();
        stop(&layout).unwrap();
        assert!(!already_running(&layout).unwrap());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
