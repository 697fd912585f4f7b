//! Stand-in local backend for lifecycle tests.
//!
//! The executable only sleeps; the test itself binds the port shortly after the
//! launch, which is what the instance waits for.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use wiremock::{Mock, MockServer};

pub(crate) fn sleeper_binary(dir: &Path) -> PathBuf {
    let path = dir.join("ollama");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Start answering on `port` with `mock` once `delay` has passed.
pub(crate) fn serve_after(port: u16, delay: Duration, mock: Mock) -> JoinHandle<MockServer> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let server = MockServer::builder().listener(listener).start().await;
        mock.mount(&server).await;
        server
    })
}
