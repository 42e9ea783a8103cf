//! Process-control strategies injected into the tunnel and daemon managers.
//!
//! Production code uses the OS-backed implementations here; tests swap in
//! fakes through the same constructors.

use std::{
    io,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::AsyncRead,
    process::{Child, Command},
};

#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};

/// Everything needed to launch a supervised subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub capture_stdout: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

pub type ChildStdout = Box<dyn AsyncRead + Send + Unpin>;

/// A running subprocess owned by its supervisor.
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;
    /// Hand over the captured stdout, once.
    fn take_stdout(&mut self) -> Option<ChildStdout>;
    /// Ask the process to stop (SIGINT).
    fn interrupt(&mut self) -> io::Result<()>;
    /// Wait for exit.
    async fn wait(&mut self) -> io::Result<()>;
    /// Force-kill and reap.
    async fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Looks up executables on `PATH`.
pub trait BinaryLocator: Send + Sync {
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PathLocator;

impl BinaryLocator for PathLocator {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        if name.trim().is_empty() {
            return None;
        }
        which::which(name).ok()
    }
}

/// Launches real subprocesses with tokio. Children are killed if their
/// handle is dropped without an explicit shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(if spec.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ChildStdout)
    }

    fn interrupt(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let pid = self
                .child
                .id()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already exited"))?;
            kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(io::Error::from)
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn wait(&mut self) -> io::Result<()> {
        self.child.wait().await.map(|_| ())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Signal-0 liveness check. EPERM means the process exists but belongs to
/// someone else, so it counts as alive.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// A detached background process request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachedSpawn {
    pub argv: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Start, check and stop processes that outlive the caller.
pub trait ProcessControl: Send + Sync {
    fn start(&self, spawn: &DetachedSpawn) -> io::Result<u32>;
    fn is_alive(&self, pid: u32) -> bool;
    /// Ask `pid` to exit (SIGTERM). A process that is already gone is not an
    /// error.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// OS-backed [`ProcessControl`]. Children run in their own session so they
/// survive the parent exiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn start(&self, spawn: &DetachedSpawn) -> io::Result<u32> {
        let (program, args) = spawn.argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "missing argv for daemon start")
        })?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .envs(spawn.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &spawn.workdir {
            cmd.current_dir(dir);
        }

        match &spawn.log_file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        let child = cmd.spawn()?;
        Ok(child.id())
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pid {pid}"),
            ));
        }
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot signal pid {pid} on this platform"),
        ))
    }
}

/// Two-phase stop for a supervised child: interrupt, wait up to `grace`,
/// then force-kill. Cancellation of `cancel` skips straight to the kill.
pub async fn stop_gracefully(
    handle: &mut dyn ProcessHandle,
    grace: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> io::Result<()> {
    if let Err(error) = handle.interrupt() {
        tracing::debug!(target = "discord_relay::process", error = %error, "interrupt failed; killing");
        return handle.kill().await;
    }

    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        waited = tokio::time::timeout(grace, handle.wait()) => waited.ok(),
    };

    match waited {
        Some(result) => result,
        None => {
            tracing::debug!(
                target = "discord_relay::process",
                pid = handle.id().unwrap_or_default(),
                "graceful stop did not finish; killing"
            );
            handle.kill().await
        }
    }
}
