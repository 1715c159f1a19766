//! Scripted [`ProcessControl`] for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio::sync::watch;

use super::control::{ExitFuture, ProcessControl};
use super::models::{Signal, StartConfig};
use crate::errors::ControlError;

/// How a fake process ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeExit {
    Clean,
    Code(i32),
    Signalled(i32),
    NoInstance,
    Message(String),
}

impl FakeExit {
    fn into_result(self) -> Result<(), ControlError> {
        match self {
            FakeExit::Clean => Ok(()),
            FakeExit::Code(exit_code) => Err(ControlError::NonZeroExit { exit_code }),
            FakeExit::Signalled(exit_code) => Err(ControlError::Signalled { exit_code }),
            FakeExit::NoInstance => Err(ControlError::NoInstance),
            FakeExit::Message(msg) => Err(ControlError::Message(msg)),
        }
    }
}

pub struct FakeControl {
    running: AtomicBool,
    listening: AtomicBool,
    fail_forward: AtomicBool,
    starts: AtomicUsize,
    start_script: Mutex<VecDeque<Result<(), ControlError>>>,
    probe_script: Mutex<VecDeque<Result<(), ControlError>>>,
    exit_on_start: Mutex<Option<FakeExit>>,
    last_config: Mutex<Option<StartConfig>>,
    signals: Mutex<Vec<Signal>>,
    forwarded: Mutex<Vec<String>>,
    exit_tx: watch::Sender<Option<FakeExit>>,
}

impl Default for FakeControl {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            listening: AtomicBool::new(true),
            fail_forward: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            start_script: Mutex::new(VecDeque::new()),
            probe_script: Mutex::new(VecDeque::new()),
            exit_on_start: Mutex::new(None),
            last_config: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
            exit_tx: watch::channel(None).0,
        }
    }
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of the next `start` call; unscripted calls succeed.
    pub fn push_start(&self, result: Result<(), ControlError>) {
        self.start_script.lock().unwrap().push_back(result);
    }

    /// Result of the next `probe_port` call; unscripted calls follow `set_listening`.
    pub fn push_probe(&self, result: Result<(), ControlError>) {
        self.probe_script.lock().unwrap().push_back(result);
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    pub fn set_fail_forward(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::SeqCst);
    }

    /// Make the next successful start die straight away.
    pub fn set_exit_on_start(&self, exit: Option<FakeExit>) {
        *self.exit_on_start.lock().unwrap() = exit;
    }

    /// Pretend a process is already up without going through `start`.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// End the current process.
    pub fn exit(&self, exit: FakeExit) {
        self.running.store(false, Ordering::SeqCst);
        self.exit_tx.send_replace(Some(exit));
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    /// Path and query of every forwarded request.
    pub fn forwarded(&self) -> Vec<String> {
        self.forwarded.lock().unwrap().clone()
    }

    pub fn last_config(&self) -> Option<StartConfig> {
        self.last_config.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, config: StartConfig) -> Result<(), ControlError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config);
        let scripted = self.start_script.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }

        self.exit_tx.send_replace(None);
        self.running.store(true, Ordering::SeqCst);
        if let Some(exit) = self.exit_on_start.lock().unwrap().take() {
            self.exit(exit);
        }
        Ok(())
    }

    async fn signal(&self, signal: Signal) -> Result<(), ControlError> {
        if !self.is_running() {
            return Err(ControlError::NoInstance);
        }
        self.signals.lock().unwrap().push(signal);
        self.exit(FakeExit::Signalled(128 + signal.as_raw()));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ControlError> {
        if self.is_running() {
            self.exit(FakeExit::Signalled(137));
        }
        Ok(())
    }

    async fn probe_port(&self, port: u16) -> Result<(), ControlError> {
        if let Some(result) = self.probe_script.lock().unwrap().pop_front() {
            return result;
        }
        if self.listening.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::NotListening { port })
        }
    }

    fn monitor(&self) -> ExitFuture {
        let mut rx = self.exit_tx.subscribe();
        Box::pin(async move {
            let exit = match rx.wait_for(Option::is_some).await {
                Ok(exit) => exit.clone(),
                Err(_) => return Err(ControlError::NoInstance),
            };
            exit.map(FakeExit::into_result)
                .unwrap_or(Err(ControlError::NoInstance))
        })
    }

    /// Echoes the request body back as the response body.
    async fn forward(
        &self,
        _port: u16,
        request: Request<Body>,
    ) -> Result<Response<Body>, ControlError> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(ControlError::Message("connection reset by peer".to_string()));
        }
        self.forwarded.lock().unwrap().push(request.uri().to_string());
        Ok(Response::new(request.into_body()))
    }
}
