//! Background server lifecycle keyed by a PID file.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

use crate::process::{DetachedSpawn, ProcessControl, SystemProcessControl};

/// Set in the daemon child's environment so it runs in the foreground
/// instead of daemonizing again.
pub const DAEMON_ENV_FLAG: &str = "DISCORD_RELAY_DAEMONIZED";
const DAEMON_FLAG: &str = "--daemon";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("no pid file found at {}", .0.display())]
    NotRunning(PathBuf),

    #[error("cannot determine cache directory for pid file")]
    NoCacheDir,

    #[error("read pid file {}: {source}", .path.display())]
    ReadPid {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid pid file {}: {content:?}", .path.display())]
    InvalidPid { path: PathBuf, content: String },

    #[error("write pid file {}: {source}", .path.display())]
    WritePid {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read env file {}: {source}", .path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("resolve current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("start daemon: {0}")]
    Spawn(#[source] io::Error),

    #[error("signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Stopped,
    Running(u32),
    /// PID file names a process that no longer exists.
    Stale(u32),
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running(pid) => write!(f, "running (pid {pid})"),
            Self::Stale(pid) => write!(f, "stale pid file ({pid})"),
        }
    }
}

pub fn default_pid_path() -> Result<PathBuf, DaemonError> {
    dirs::cache_dir()
        .map(|dir| dir.join("discord-relay").join("server.pid"))
        .ok_or(DaemonError::NoCacheDir)
}

/// True when running as the child started by [`DaemonManager::start`].
pub fn is_daemon_child() -> bool {
    std::env::var(DAEMON_ENV_FLAG).is_ok_and(|value| value == "1")
}

/// Drop `--daemon` so the child does not try to detach again.
pub fn filter_daemon_argv<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter().filter(|arg| arg != DAEMON_FLAG).collect()
}

/// Current executable plus this process's arguments, minus `--daemon`.
pub fn daemon_child_argv() -> Result<Vec<String>, DaemonError> {
    let exe = std::env::current_exe().map_err(DaemonError::CurrentExe)?;
    let mut argv = vec![exe.to_string_lossy().into_owned()];
    argv.extend(filter_daemon_argv(std::env::args().skip(1)));
    Ok(argv)
}

pub struct DaemonManager {
    options: DaemonOptions,
    pid_file: PathBuf,
    control: Arc<dyn ProcessControl>,
}

impl DaemonManager {
    pub fn new(
        options: DaemonOptions,
        control: Arc<dyn ProcessControl>,
    ) -> Result<Self, DaemonError> {
        let pid_file = match &options.pid_file {
            Some(path) => path.clone(),
            None => default_pid_path()?,
        };
        Ok(Self {
            options,
            pid_file,
            control,
        })
    }

    pub fn system(options: DaemonOptions) -> Result<Self, DaemonError> {
        Self::new(options, Arc::new(SystemProcessControl))
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_file
    }

    /// Spawn `argv` detached and record its PID. A PID file naming a live
    /// process blocks the start; a stale one is overwritten.
    ///
    /// The check-then-write on the PID file is not locked, so two concurrent
    /// starts can race.
    pub fn start(&self, argv: &[String]) -> Result<u32, DaemonError> {
        match read_pid(&self.pid_file) {
            Ok(None) => {}
            Ok(Some(pid)) if self.control.is_alive(pid) => {
                return Err(DaemonError::AlreadyRunning(pid));
            }
            Ok(Some(pid)) => tracing::info!(
                target = "discord_relay::daemon",
                pid = pid,
                path = %self.pid_file.display(),
                "replacing stale pid file"
            ),
            // Unparsable content names no process.
            Err(DaemonError::InvalidPid { content, .. }) => tracing::warn!(
                target = "discord_relay::daemon",
                path = %self.pid_file.display(),
                content = %content.trim(),
                "replacing unreadable pid file"
            ),
            Err(error) => return Err(error),
        }

        let mut env = match &self.options.env_file {
            Some(path) => read_env_file(path)?,
            None => Vec::new(),
        };
        env.push((DAEMON_ENV_FLAG.to_string(), "1".to_string()));

        let spawn = DetachedSpawn {
            argv: argv.to_vec(),
            log_file: self.options.log_file.clone(),
            workdir: self.options.workdir.clone(),
            env,
        };
        let pid = self.control.start(&spawn).map_err(DaemonError::Spawn)?;
        write_pid(&self.pid_file, pid)?;
        tracing::info!(
            target = "discord_relay::daemon",
            pid = pid,
            path = %self.pid_file.display(),
            "daemon started"
        );
        Ok(pid)
    }

    /// Signal the recorded process and remove the PID file. A recorded
    /// process that already exited still counts as stopped.
    pub fn stop(&self) -> Result<u32, DaemonError> {
        let pid = read_pid(&self.pid_file)?
            .ok_or_else(|| DaemonError::NotRunning(self.pid_file.clone()))?;

        if self.control.is_alive(pid) {
            self.control
                .terminate(pid)
                .map_err(|source| DaemonError::Signal { pid, source })?;
        } else {
            tracing::debug!(
                target = "discord_relay::daemon",
                pid = pid,
                "recorded process already exited"
            );
        }

        match std::fs::remove_file(&self.pid_file) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => tracing::warn!(
                target = "discord_relay::daemon",
                path = %self.pid_file.display(),
                error = %error,
                "failed to remove pid file"
            ),
        }
        Ok(pid)
    }

    pub fn status(&self) -> Result<DaemonStatus, DaemonError> {
        Ok(match read_pid(&self.pid_file)? {
            None => DaemonStatus::Stopped,
            Some(pid) if self.control.is_alive(pid) => DaemonStatus::Running(pid),
            Some(pid) => DaemonStatus::Stale(pid),
        })
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>, DaemonError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::ReadPid {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(DaemonError::InvalidPid {
            path: path.to_path_buf(),
            content,
        }),
    }
}

fn write_pid(path: &Path, pid: u32) -> Result<(), DaemonError> {
    use std::io::Write;

    let wrap = |source| DaemonError::WritePid {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(wrap)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    write!(tmp, "{pid}").map_err(wrap)?;
    tmp.persist(path).map_err(|error| wrap(error.error))?;
    Ok(())
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, DaemonError> {
    let wrap = |source| DaemonError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    dotenvy::from_path_iter(path)
        .map_err(wrap)?
        .map(|item| item.map_err(wrap))
        .collect()
}
