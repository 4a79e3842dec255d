//! unixctl control surface: a unix-socket listener thread accepting
//! line-delimited JSON requests (`{"method": ..., "params": [...]}`) and
//! forwarding them over a channel into the main loop, which dispatches
//! between engine iterations and replies through the request handle.

use crate::errors::ControllerError;
use crossbeam::channel::{unbounded, Receiver, Sender};
use flowsync_types::log::{debug, warn};
use flowsync_types::serde_json;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Debug, Deserialize)]
struct WireRequest {
    method: String,
    #[serde(default)]
    params: Vec<String>,
}

#[derive(Debug)]
pub struct UnixctlRequest {
    pub method: String,
    pub params: Vec<String>,
    reply_tx: Sender<String>,
}

impl UnixctlRequest {
    pub fn reply(self, body: impl Into<String>) {
        // The peer may have gone away; nothing to do about it.
        let _ = self.reply_tx.send(body.into());
    }

    pub fn reply_error(self, body: impl Into<String>) {
        let _ = self.reply_tx.send(format!("error: {}", body.into()));
    }
}

#[derive(Debug)]
pub struct UnixctlServer {
    rx: Receiver<UnixctlRequest>,
    path: PathBuf,
}

impl UnixctlServer {
    /// Binds the control socket and spawns the accept loop. A bind
    /// failure is fatal: it happens before the main loop starts.
    pub fn bind(path: &Path) -> Result<Self, ControllerError> {
        // A stale socket from a previous run would fail the bind.
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(|source| ControllerError::UnixctlBind {
            path: path.display().to_string(),
            source,
        })?;
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("unixctl".to_string())
            .spawn(move || accept_loop(listener, tx))
            .map_err(|source| ControllerError::UnixctlBind {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            rx,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Requests that arrived since the last drain, without blocking.
    pub fn drain(&self) -> Vec<UnixctlRequest> {
        self.rx.try_iter().collect()
    }

    /// The raw channel, for the main loop's poll-block.
    pub fn receiver(&self) -> &Receiver<UnixctlRequest> {
        &self.rx
    }
}

impl Drop for UnixctlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn accept_loop(listener: UnixListener, tx: Sender<UnixctlRequest>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let tx = tx.clone();
                if thread::Builder::new()
                    .name("unixctl-conn".to_string())
                    .spawn(move || serve_connection(stream, tx))
                    .is_err()
                {
                    warn!("unixctl: cannot spawn connection thread");
                }
            }
            Err(err) => {
                warn!("unixctl: accept failed: {err}");
                return;
            }
        }
    }
}

fn serve_connection(stream: UnixStream, tx: Sender<UnixctlRequest>) {
    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let mut writer = write_half;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else {
            return;
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let _ = writeln!(writer, "error: malformed request: {err}");
                continue;
            }
        };
        debug!("unixctl: {} {:?}", request.method, request.params);
        let (reply_tx, reply_rx) = unbounded();
        if tx
            .send(UnixctlRequest {
                method: request.method,
                params: request.params,
                reply_tx,
            })
            .is_err()
        {
            // Main loop is gone; drop the connection.
            return;
        }
        match reply_rx.recv() {
            Ok(reply) => {
                if writeln!(writer, "{}", serde_json::json!(reply)).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_reply_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowsyncd.ctl");
        let server = UnixctlServer::bind(&path).unwrap();

        let client = thread::spawn({
            let path = path.clone();
            move || {
                let mut stream = UnixStream::connect(&path).unwrap();
                writeln!(stream, "{}", r#"{"method":"debug/status"}"#).unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                line
            }
        });

        // Main-loop side: poll until the request shows up, then reply.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let request = loop {
            if let Some(request) = server.drain().into_iter().next() {
                break request;
            }
            assert!(std::time::Instant::now() < deadline, "request never arrived");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(request.method, "debug/status");
        request.reply("running");

        let line = client.join().unwrap();
        assert!(line.contains("running"));
    }
}
