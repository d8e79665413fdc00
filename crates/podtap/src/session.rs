use crate::artifacts;
use crate::registry::Registry;
use crate::Config;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Rotated files kept when the annotation value is unusable in rotation mode.
const DEFAULT_ROTATE_COUNT: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error("a capture session for this pod is already active")]
    AlreadyActive,
    #[error("failed to spawn capture process")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle states of a capture session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    /// Process spawned but the session is not yet registered.
    Starting = 0,
    /// Capture in progress.
    Running = 1,
    /// One stop path won the state race and is tearing the session down.
    Stopping = 2,
    /// Process exited and the session was deregistered.
    Terminated = 3,
}

/// One running capture process, tied to one pod.
///
/// A session is reachable only through the Registry. It leaves the Registry
/// through exactly one of: explicit stop (annotation removed), pod deletion,
/// natural expiry, process self-exit, or the shutdown drain. All five paths
/// funnel through the Running → Stopping transition of `begin_stop`, so the
/// termination sequence runs at most once.
pub struct Session {
    /// Stable UID of the pod; the Registry key.
    pub pod_uid: String,
    /// Pod name, from which artifact file names derive.
    pub pod_name: String,
    /// Effective capture duration.
    /// None in rotation mode: the session runs until explicitly stopped.
    pub duration: Option<std::time::Duration>,
    /// When the capture process was spawned.
    pub started_at: std::time::SystemTime,

    state: AtomicU8,
    child: process_guard::Child,
    /// Requests cooperative stop and disarms the expiry timer.
    cancel: CancellationToken,
    /// Resolves once the session is terminated and deregistered.
    done: CancellationToken,
    /// Capture request observed while this session was stopping.
    /// Its successor session starts once the teardown completes.
    restart: Mutex<Option<String>>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            0 => SessionState::Starting,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Terminated,
        }
    }

    /// Attempt the Running → Stopping transition.
    /// Exactly one caller wins over the life of a session, and only the
    /// winner may run the termination sequence.
    pub fn begin_stop(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Running as u8,
                SessionState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Wait until the session is fully terminated and deregistered.
    /// Stop paths which lose the `begin_stop` race wait here.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub(crate) fn set_restart(&self, requested: String) {
        *self.restart.lock().unwrap() = Some(requested);
    }

    pub(crate) fn take_restart(&self) -> Option<String> {
        self.restart.lock().unwrap().take()
    }

    /// Discard a pending restart. Called when a later event for the pod
    /// carries no capture request, which supersedes the earlier re-add.
    pub(crate) fn clear_restart(&self) {
        *self.restart.lock().unwrap() = None;
    }
}

/// Start a capture session: validate the requested parameter, spawn the
/// capture process, and register the session. The spawn runs inside the
/// Registry critical section, so a concurrent start for the same pod observes
/// either no session or the completed one, and a spawn failure registers
/// nothing.
pub fn start(
    registry: &Arc<Registry>,
    config: &Arc<Config>,
    pod_uid: &str,
    pod_name: &str,
    requested: &str,
) -> Result<Arc<Session>, StartError> {
    let (duration, rotation) = match config.rotate_file_size {
        None => {
            let duration = parse_param(requested)
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| {
                    tracing::warn!(pod = %pod_name, value = %requested, default = ?config.default_duration,
                        "unusable capture duration, using default");
                    config.default_duration
                });
            (Some(duration), None)
        }
        Some(size) => {
            let count = parse_param(requested).unwrap_or_else(|| {
                tracing::warn!(pod = %pod_name, value = %requested, default = DEFAULT_ROTATE_COUNT,
                    "unusable rotation count, using default");
                DEFAULT_ROTATE_COUNT
            });
            (None, Some((size, count)))
        }
    };

    let mut stderr = None;
    let session = registry.insert_with(pod_uid, || {
        let mut cmd = process_guard::Command::new(&config.capture_command);
        cmd.args(capture_args(config, pod_name, rotation))
            .stdin(process_guard::Stdio::null())
            .stdout(process_guard::Stdio::null())
            .stderr(process_guard::Stdio::piped());

        let mut child = process_guard::Child::spawn(&mut cmd).map_err(StartError::Spawn)?;
        stderr = child.stderr.take();

        let session = Arc::new(Session {
            pod_uid: pod_uid.to_string(),
            pod_name: pod_name.to_string(),
            duration,
            started_at: std::time::SystemTime::now(),
            state: AtomicU8::new(SessionState::Starting as u8),
            child,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            restart: Mutex::new(None),
        });
        // Transition to Running before the registry lock is released. A
        // registered session is never observable as Starting, so begin_stop()
        // needs to consider only Running.
        session.set_state(SessionState::Running);
        Ok(session)
    })?;

    if let Some(stderr) = stderr {
        tokio::spawn(relay_stderr(stderr, session.pod_name.clone()));
    }
    tokio::spawn(monitor(session.clone(), registry.clone(), config.clone()));

    tracing::info!(
        pod = %pod_name,
        pid = session.child.id(),
        duration = ?session.duration,
        path = %artifacts::capture_path(&config.output_dir, pod_name).display(),
        "started capture"
    );

    Ok(session)
}

/// Parse the annotation value as a positive integer.
/// Anything else yields None and the caller substitutes its default.
fn parse_param(value: &str) -> Option<u64> {
    value.parse::<i64>().ok().filter(|n| *n > 0).map(|n| n as u64)
}

/// Arguments of the capture process: capture everything on the interface,
/// packet-buffered, written to the pod's artifact path. Rotation mode bounds
/// the file size and count instead of the duration.
fn capture_args(
    config: &Config,
    pod_name: &str,
    rotation: Option<(u64, u64)>,
) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> =
        vec!["-i".into(), config.interface.clone().into(), "-U".into()];

    if let Some((size, count)) = rotation {
        args.push("-C".into());
        args.push(size.to_string().into());
        args.push("-W".into());
        args.push(count.to_string().into());
    }
    args.push("-w".into());
    args.push(artifacts::capture_path(&config.output_dir, pod_name).into_os_string());

    args
}

/// Relay capture tool stderr into the log, tagged with the pod.
/// tcpdump reports its interface banner and packet counts there.
async fn relay_stderr(stderr: process_guard::ChildStdio, pod_name: String) {
    use tokio::io::AsyncBufReadExt;

    let mut stderr = tokio::io::BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();

        match stderr.read_line(&mut line).await {
            Err(error) => {
                tracing::error!(pod = %pod_name, %error, "failed to read capture process stderr");
                break;
            }
            Ok(0) => break, // Clean EOF.
            Ok(_) => (),
        }
        tracing::debug!(pod = %pod_name, message = %line.trim_end(), "capture process output");
    }
}

/// Monitor a running session until cooperative cancellation, natural expiry,
/// or the capture process exiting on its own, whichever is first. The
/// cancellation arm doubles as the timer disarm: an early stop cancels the
/// token and the armed sleep is dropped with this task.
async fn monitor(session: Arc<Session>, registry: Arc<Registry>, config: Arc<Config>) {
    let expiry = async {
        match session.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        () = session.cancel.cancelled() => {
            // The stop path which cancelled us owns the termination sequence.
        }
        () = expiry => {
            if session.begin_stop() {
                tracing::info!(pod = %session.pod_name, duration = ?session.duration, "capture duration elapsed");
                terminate(&session, config.delete_on_expiry, &registry, &config).await;
            }
        }
        status = session.child.wait() => {
            if session.begin_stop() {
                match &status {
                    Ok(status) => {
                        tracing::warn!(pod = %session.pod_name, %status, "capture process exited on its own");
                    }
                    Err(error) => {
                        tracing::error!(pod = %session.pod_name, %error, "failed to wait for capture process");
                    }
                }
                terminate(&session, false, &registry, &config).await;
            }
        }
    }
}

/// Run the termination sequence. The caller must have won `begin_stop`, so
/// this executes at most once per session: SIGTERM, then a bounded wait, then
/// SIGKILL if the process lingers. Artifact files are swept only when
/// `delete_files` is set. Deregistration and the completion latch come last,
/// so waiters observe a fully torn-down session.
pub(crate) async fn terminate(
    session: &Arc<Session>,
    delete_files: bool,
    registry: &Arc<Registry>,
    config: &Arc<Config>,
) {
    tracing::info!(pod = %session.pod_name, delete_files, "stopping capture");

    // Unblock the monitor and disarm the expiry timer.
    session.cancel.cancel();

    if let Err(error) = session.child.signal(libc::SIGTERM) {
        tracing::warn!(pod = %session.pod_name, %error, "failed to deliver SIGTERM to capture process");
    }

    match tokio::time::timeout(config.grace_timeout, session.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(pod = %session.pod_name, %status, "capture process exited");
        }
        Ok(Err(error)) => {
            tracing::warn!(pod = %session.pod_name, %error, "failed to wait for capture process");
        }
        Err(_) => {
            tracing::warn!(pod = %session.pod_name, grace = ?config.grace_timeout,
                "capture process did not exit in time and is being killed");

            if let Err(error) = session.child.kill() {
                tracing::warn!(pod = %session.pod_name, %error, "failed to kill capture process");
            }
            match session.child.wait().await {
                Ok(status) => {
                    tracing::debug!(pod = %session.pod_name, %status, "capture process exited after SIGKILL");
                }
                Err(error) => {
                    tracing::warn!(pod = %session.pod_name, %error, "failed to reap killed capture process");
                }
            }
        }
    }

    if delete_files {
        let removed = artifacts::remove_all(&config.output_dir, &session.pod_name);
        if removed != 0 {
            tracing::info!(pod = %session.pod_name, files = removed, "deleted capture artifacts");
        }
    }

    let restart = registry.finish(session);

    tracing::info!(
        pod = %session.pod_name,
        elapsed = ?session.started_at.elapsed().unwrap_or_default(),
        "capture stopped"
    );

    // A capture re-requested during this teardown starts its successor now,
    // before the done latch resolves, so a waiter observes either no session
    // for the pod or the fully started new one.
    if let Some(requested) = restart {
        match start(registry, config, &session.pod_uid, &session.pod_name, &requested) {
            Ok(_) | Err(StartError::AlreadyActive) => (),
            Err(error) => {
                tracing::error!(pod = %session.pod_name, ?error, "failed to restart capture");
            }
        }
    }

    session.done.cancel();
}

/// Stop every active session, preserving artifact files, and return only once
/// the registry is empty. A session already being stopped by another path is
/// awaited rather than raced, and the sweep repeats so a successor started by
/// an in-flight teardown is stopped as well.
pub async fn drain_all(registry: &Arc<Registry>, config: &Arc<Config>) {
    loop {
        let sessions = registry.snapshot();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(sessions = sessions.len(), "draining active captures");

        let drains = sessions.into_iter().map(|session| async move {
            if session.begin_stop() {
                terminate(&session, false, registry, config).await;
            } else {
                // A restart requested during the teardown is moot now.
                session.clear_restart();
                session.done().await;
            }
        });
        futures::future::join_all(drains).await;
    }
}

#[cfg(test)]
pub(crate) fn test_session(pod_uid: &str, pod_name: &str) -> Arc<Session> {
    // Sleep for five minutes; dropping the Child tears it down.
    let child =
        process_guard::Child::spawn(process_guard::Command::new("sleep").arg("300")).unwrap();

    Arc::new(Session {
        pod_uid: pod_uid.to_string(),
        pod_name: pod_name.to_string(),
        duration: None,
        started_at: std::time::SystemTime::now(),
        state: AtomicU8::new(SessionState::Running as u8),
        child,
        cancel: CancellationToken::new(),
        done: CancellationToken::new(),
        restart: Mutex::new(None),
    })
}
