//! [`ProcessControl`] backed by a child process on this host.
//!
//! The entrypoint is spawned with `tokio::process`, its output is relayed to
//! `tracing`, and a waiter task publishes the exit status on a watch channel
//! that every [`ProcessControl::monitor`] call subscribes to.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use axum::http::{Request, Response, header};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;

use super::control::{ExitFuture, ProcessControl};
use super::models::{Signal, StartConfig};
use crate::errors::ControlError;

/// Request chunks buffered between the client and the worker.
const BODY_CHUNK_BUFFER: usize = 8;

/// Exit codes for signal deaths follow the shell convention.
const SIGNAL_EXIT_BASE: i32 = 128;

#[derive(Debug, Clone)]
enum ExitRecord {
    Code(i32),
    Signal(i32),
    WaitFailed(String),
}

#[derive(Default)]
struct LocalState {
    pid: Option<u32>,
    exit_watch: Option<watch::Receiver<Option<ExitRecord>>>,
}

pub struct LocalProcess {
    identity: String,
    ping_timeout: Duration,
    http: reqwest::Client,
    running: Arc<AtomicBool>,
    state: Mutex<LocalState>,
}

impl LocalProcess {
    pub fn new(identity: impl Into<String>, ping_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            identity: identity.into(),
            ping_timeout,
            http,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LocalState::default()),
        })
    }

    fn pid(&self) -> Option<u32> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pid
    }
}

fn relay_output<R>(identity: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(identity = %identity, stream, "{}", line);
        }
    });
}

#[async_trait]
impl ProcessControl for LocalProcess {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, config: StartConfig) -> Result<(), ControlError> {
        if self.is_running() {
            return Ok(());
        }
        let (program, args) = config
            .entrypoint
            .split_first()
            .ok_or_else(|| ControlError::Message("no entrypoint configured".to_string()))?;
        if !config.enable_internet {
            tracing::warn!(identity = %self.identity, "network isolation is not enforced for local processes");
        }

        let mut child = Command::new(program)
            .args(args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        tracing::info!(identity = %self.identity, pid, program = %program, "process spawned");

        if let Some(stdout) = child.stdout.take() {
            relay_output(self.identity.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(self.identity.clone(), "stderr", stderr);
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pid = pid;
            state.exit_watch = Some(rx);
        }
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let identity = self.identity.clone();
        tokio::spawn(async move {
            let record = match child.wait().await {
                Ok(status) => match (status.code(), status.signal()) {
                    (Some(code), _) => ExitRecord::Code(code),
                    (None, Some(sig)) => ExitRecord::Signal(sig),
                    (None, None) => ExitRecord::WaitFailed(format!("unknown exit status: {}", status)),
                },
                Err(e) => ExitRecord::WaitFailed(e.to_string()),
            };
            tracing::debug!(identity = %identity, ?record, "process exited");
            running.store(false, Ordering::SeqCst);
            let _ = tx.send(Some(record));
        });

        Ok(())
    }

    async fn signal(&self, signal: Signal) -> Result<(), ControlError> {
        let pid = match self.pid() {
            Some(pid) if self.is_running() => pid,
            _ => return Err(ControlError::NoInstance),
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc != 0 {
            return Err(ControlError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ControlError> {
        if !self.is_running() {
            return Ok(());
        }
        self.signal(Signal::Kill).await
    }

    async fn probe_port(&self, port: u16) -> Result<(), ControlError> {
        match tokio::time::timeout(self.ping_timeout, TcpStream::connect(("127.0.0.1", port))).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(ControlError::NotListening { port })
            }
            Ok(Err(e)) => Err(ControlError::Io(e)),
            Err(_) => Err(ControlError::Message(format!(
                "ping to port {} timed out after {}ms",
                port,
                self.ping_timeout.as_millis()
            ))),
        }
    }

    fn monitor(&self) -> ExitFuture {
        let exit_watch = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exit_watch
            .clone();
        Box::pin(async move {
            let Some(mut rx) = exit_watch else {
                return Err(ControlError::NoInstance);
            };
            let record = match rx.wait_for(Option::is_some).await {
                Ok(record) => record.clone(),
                Err(_) => return Err(ControlError::NoInstance),
            };
            match record {
                Some(ExitRecord::Code(0)) => Ok(()),
                Some(ExitRecord::Code(exit_code)) => Err(ControlError::NonZeroExit { exit_code }),
                Some(ExitRecord::Signal(sig)) => Err(ControlError::Signalled {
                    exit_code: SIGNAL_EXIT_BASE + sig,
                }),
                Some(ExitRecord::WaitFailed(message)) => Err(ControlError::Message(message)),
                None => Err(ControlError::NoInstance),
            }
        })
    }

    async fn forward(
        &self,
        port: u16,
        request: Request<Body>,
    ) -> Result<Response<Body>, ControlError> {
        let (mut parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://127.0.0.1:{}{}", port, path);
        parts.headers.remove(header::HOST);

        let upstream = self
            .http
            .request(parts.method, &url)
            .headers(parts.headers)
            .body(reqwest::Body::wrap_stream(pump_body(body)))
            .send()
            .await
            .map_err(|e| ControlError::Message(format!("Failed to reach port {}: {}", port, e)))?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                upstream
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ControlError::Message(format!("Failed to build response: {}", e)))
    }
}

/// Feed `body` to the upstream request chunk by chunk. The body, and any
/// stream guard inside it, lives until it ends or the request is dropped.
fn pump_body(body: Body) -> mpsc::Receiver<Result<Bytes, axum::Error>> {
    let (mut tx, rx) = mpsc::channel(BODY_CHUNK_BUFFER);
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    rx
}
