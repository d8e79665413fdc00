pub use std::process::{Command, ExitStatus, Stdio};

use shared_child::unix::SharedChildExt;
use shared_child::SharedChild;
use std::os::fd::OwnedFd;
use std::sync::Arc;

// How long a dropped child may linger after SIGTERM before it's killed.
const DROP_GRACE: std::time::Duration = std::time::Duration::from_secs(15);

/// Child is a spawned process which is guaranteed to be reaped and to not
/// outlive its handle: dropping a running Child delivers SIGTERM and arms a
/// watchdog that escalates to SIGKILL if the process lingers.
pub struct Child {
    inner: Arc<SharedChild>,

    pub stdin: Option<ChildStdio>,
    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

pub type ChildStdio = tokio::fs::File;

impl Child {
    /// Spawn `cmd` and wrap its process in a Child.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
        let mut inner = cmd.spawn()?;

        let stdin = map_stdio(inner.stdin.take());
        let stdout = map_stdio(inner.stdout.take());
        let stderr = map_stdio(inner.stderr.take());

        Ok(Self {
            inner: Arc::new(SharedChild::new(inner)?),
            stdin,
            stdout,
            stderr,
        })
    }

    /// OS identifier of the spawned process.
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Wait for the process to exit.
    /// Multiple callers may wait concurrently, and each observes its exit status.
    pub fn wait(&self) -> impl std::future::Future<Output = std::io::Result<ExitStatus>> {
        let cloned_inner = self.inner.clone();
        let handle = tokio::runtime::Handle::current().spawn_blocking(move || cloned_inner.wait());
        async move { handle.await.expect("wait does not panic") }
    }

    /// Return the exit status if the process has already exited, without blocking.
    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }

    /// Deliver `signal` to the process.
    /// Returns Ok without signaling if the process has already been reaped.
    pub fn signal(&self, signal: i32) -> std::io::Result<()> {
        self.inner.send_signal(signal)
    }

    /// Forcefully kill the process with SIGKILL.
    /// Returns Ok without signaling if the process has already been reaped.
    pub fn kill(&self) -> std::io::Result<()> {
        self.inner.kill()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.inner.try_wait() {
            return; // Already exited.
        }
        let pid = self.inner.id();

        // Note that send_signal() returns Ok() if the child has been waited on.
        if let Err(error) = self.inner.send_signal(libc::SIGTERM) {
            tracing::error!(%pid, ?error, "failed to deliver SIGTERM to child process");
        }

        let inner = self.inner.clone();
        let wait = self.wait();

        _ = tokio::runtime::Handle::current().spawn(async move {
            let timeout = tokio::time::sleep(DROP_GRACE);

            tokio::select! {
                exit_code = wait => match exit_code {
                    Err(error) => {
                        tracing::error!(%pid, ?error, "failed to wait for dropped child process");
                    },
                    Ok(exit_code) if !exit_code.success() => {
                        tracing::warn!(%pid, ?exit_code, "dropped child process exited with an error");
                    }
                    Ok(_) => {
                        tracing::debug!(%pid, "dropped child process exited cleanly");
                    }
                },
                _ = timeout => {
                    tracing::error!(%pid, "dropped child process ignored SIGTERM and is being killed");
                    if let Err(error) = inner.kill() {
                        tracing::error!(%pid, ?error, "failed to kill dropped child process");
                    }
                    // The concurrent wait() started above reaps the process once the kill lands.
                }
            };
        });
    }
}

fn map_stdio<F>(f: Option<F>) -> Option<ChildStdio>
where
    F: Into<OwnedFd>,
{
    let f: Option<OwnedFd> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}
