//! Local Ollama process lifecycle.
//!
//! Finds the backend executable, launches `ollama serve` on the configured port
//! with the model directory and override environment applied, and stops it on
//! request. Every start/stop goes through one async mutex so an idle stop can
//! never interleave with a start.

use shared::settings::BackendSettings;
use shared::ChatError;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long a freshly spawned backend gets to start listening
const STARTUP_WAIT: Duration = Duration::from_secs(8);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owned local backend process, if any.
pub struct LocalInstance {
    child: Mutex<Option<Child>>,
}

impl LocalInstance {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Launch the backend unless one we own is still alive.
    pub async fn start(&self, settings: &BackendSettings) -> Result<(), ChatError> {
        let mut slot = self.child.lock().await;
        start_locked(&mut slot, settings).await
    }

    /// Terminate the owned process. Never fails.
    pub async fn stop(&self) {
        let mut slot = self.child.lock().await;
        stop_locked(&mut slot).await;
    }

    /// Stop then start under a single lock acquisition.
    pub async fn reset(&self, settings: &BackendSettings) -> Result<(), ChatError> {
        let mut slot = self.child.lock().await;
        stop_locked(&mut slot).await;
        start_locked(&mut slot, settings).await
    }

    /// Stop only when nothing is in flight. Checked while holding the lock, so a
    /// request that registered itself first always keeps the process alive.
    pub async fn stop_if_idle(&self, in_flight: &AtomicUsize) -> bool {
        let mut slot = self.child.lock().await;
        if slot.is_none() || in_flight.load(Ordering::SeqCst) > 0 {
            return false;
        }
        stop_locked(&mut slot).await;
        true
    }
}

impl Default for LocalInstance {
    fn default() -> Self {
        Self::new()
    }
}

async fn start_locked(
    slot: &mut Option<Child>,
    settings: &BackendSettings,
) -> Result<(), ChatError> {
    if let Some(child) = slot.as_mut() {
        match child.try_wait() {
            Ok(None) => return Ok(()),
            Ok(Some(status)) => {
                tracing::warn!(%status, "local backend exited, restarting");
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not poll local backend, restarting");
            }
        }
        *slot = None;
    }

    let binary = find_backend_binary(settings)
        .ok_or_else(|| ChatError::startup("Ollama executable not found"))?;

    let port = settings.local_port;
    if !port_available(port) {
        return Err(ChatError::startup(format!(
            "port {} is already in use",
            port
        )));
    }

    let mut cmd = Command::new(&binary);
    cmd.arg("serve")
        .env("OLLAMA_HOST", format!("127.0.0.1:{}", port))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = &settings.model_directory {
        cmd.env("OLLAMA_MODELS", dir);
    }
    for (key, value) in &settings.overrides {
        if !value.is_empty() {
            cmd.env(key, value);
        }
    }

    let mut child = cmd.spawn().map_err(|e| {
        ChatError::startup(format!("failed to launch {}: {}", binary.display(), e))
    })?;

    if let Err(e) = wait_until_reachable(&mut child, port, STARTUP_WAIT).await {
        let _ = child.kill().await;
        return Err(e);
    }

    tracing::info!(port, binary = %binary.display(), "local backend started");
    *slot = Some(child);
    Ok(())
}

async fn stop_locked(slot: &mut Option<Child>) {
    if let Some(mut child) = slot.take() {
        match child.kill().await {
            Ok(()) => tracing::info!("local backend stopped"),
            Err(e) => tracing::warn!(error = %e, "failed to kill local backend"),
        }
    }
}

/// Locate the backend executable.
///
/// Search order:
/// - the explicit `binary` setting (must exist)
/// - `ollama` / `ollama.exe` on PATH
pub fn find_backend_binary(settings: &BackendSettings) -> Option<PathBuf> {
    if let Some(path) = &settings.binary {
        return path.is_file().then(|| path.clone());
    }

    let name = if cfg!(windows) { "ollama.exe" } else { "ollama" };
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Whether nothing is bound to the port on loopback.
pub fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Poll until the backend accepts connections, it exits, or the timeout passes.
async fn wait_until_reachable(
    child: &mut Child,
    port: u16,
    timeout: Duration,
) -> Result<(), ChatError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ChatError::startup(format!(
                "backend exited during startup ({})",
                status
            )));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ChatError::startup(format!(
                "backend didn't become reachable within {} seconds",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
