//! Helper process tunnels
//!
//! Launches `gcloud compute start-iap-tunnel` and waits for it to bind the
//! reserved local port. Readiness is detected by polling the TCP table; the
//! helper's stderr is captured and classified when it reports a problem.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::factory::TunnelFactory;
use crate::handle::{TunnelControl, TunnelHandle};
use crate::ports::{is_listening, PortFinder, PortReservation};
use async_trait::async_trait;
use iaptun_proto::Destination;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Marker the Cloud SDK prints when `start-iap-tunnel` is not available in
/// the installed release track
pub const OUTDATED_TOOLING_MARKER: &str = "alternate release tracks";

/// Lines the helper prints during normal startup
const INFORMATIONAL_PREFIXES: &[&str] = &["Testing if tunnel connection works", "Listening on port"];

/// How long to wait for the rest of stderr once the helper has exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens tunnels by running the Cloud SDK tunnel helper
pub struct HelperProcessFactory {
    program: String,
    poll_attempts: u32,
    ports: PortFinder,
}

impl HelperProcessFactory {
    pub fn new(program: impl Into<String>, ports: PortFinder) -> Self {
        Self {
            program: program.into(),
            poll_attempts: TunnelConfig::default().helper_poll_attempts,
            ports,
        }
    }

    pub fn from_config(config: &TunnelConfig, ports: PortFinder) -> Self {
        Self::new(config.helper_program.clone(), ports).with_poll_attempts(config.helper_poll_attempts)
    }

    pub fn with_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts.max(1);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn spawn(&self, destination: &Destination, local_port: u16) -> Result<Child, TunnelError> {
        Command::new(&self.program)
            .args(helper_args(destination, local_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    TunnelError::HelperNotFound {
                        program: self.program.clone(),
                    }
                } else {
                    TunnelError::HelperCommandFailed(format!(
                        "failed to launch {}: {}",
                        self.program, e
                    ))
                }
            })
    }

    async fn wait_until_ready(
        &self,
        child: &mut Child,
        destination: &Destination,
        local_port: u16,
        timeout: Duration,
        stderr: &StderrCapture,
        mut reader: Option<JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        let table = self.ports.table();
        let interval = timeout / self.poll_attempts;

        for attempt in 1..=self.poll_attempts {
            if is_listening(&*table, local_port)? {
                debug!(destination = %destination, local_port, attempt, "Helper is listening");
                return Ok(());
            }

            if let Some(error) = classify_stderr(&stderr.snapshot()) {
                return Err(error);
            }

            if let Some(status) = child.try_wait()? {
                // Let the reader catch up with whatever the helper wrote last
                if let Some(reader) = reader.take() {
                    let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await;
                }
                return Err(classify_stderr(&stderr.snapshot()).unwrap_or_else(|| {
                    TunnelError::HelperCommandFailed(format!(
                        "{} exited with {} before binding port {}",
                        self.program, status, local_port
                    ))
                }));
            }

            tokio::time::sleep(interval).await;
        }

        Err(TunnelError::Timeout {
            destination: destination.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl TunnelFactory for HelperProcessFactory {
    async fn open(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TunnelHandle, TunnelError> {
        let reservation = self.ports.find_free_port()?;
        let port = reservation.port();

        let mut child = self.spawn(destination, port)?;
        let process_id = child.id();
        debug!(
            destination = %destination,
            local_port = port,
            pid = ?process_id,
            program = %self.program,
            "Started tunnel helper"
        );

        let stderr = Arc::new(StderrCapture::new());
        let reader = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture_stderr(pipe, Arc::clone(&stderr))));

        if let Err(e) = self
            .wait_until_ready(&mut child, destination, port, timeout, &stderr, reader)
            .await
        {
            if let Err(kill_error) = child.start_kill() {
                debug!(error = %kill_error, "Tunnel helper already gone");
            }
            return Err(e);
        }
        stderr.stop_buffering();

        info!(
            destination = %destination,
            local_port = port,
            pid = ?process_id,
            "Tunnel helper ready"
        );

        Ok(TunnelHandle::new(
            destination.clone(),
            port,
            HelperProcessControl {
                child: Mutex::new(Some(child)),
                reservation: Mutex::new(Some(reservation)),
            },
        )
        .with_process_id(process_id))
    }
}

struct HelperProcessControl {
    child: Mutex<Option<Child>>,
    reservation: Mutex<Option<PortReservation>>,
}

impl TunnelControl for HelperProcessControl {
    fn close(&self) -> Result<(), TunnelError> {
        self.reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match child {
            Some(mut child) => match child.start_kill() {
                Ok(()) => {
                    debug!(pid = ?child.id(), "Terminated tunnel helper");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => {
                    warn!(error = %e, "Failed to terminate tunnel helper");
                    Err(e.into())
                }
            },
            None => Ok(()),
        }
    }
}

/// Arguments passed to the helper program
pub fn helper_args(destination: &Destination, local_port: u16) -> Vec<String> {
    vec![
        "compute".to_string(),
        "start-iap-tunnel".to_string(),
        destination.instance_name.clone(),
        destination.remote_port.to_string(),
        format!("--local-host-port=localhost:{}", local_port),
        format!("--project={}", destination.project_id),
        format!("--zone={}", destination.zone),
    ]
}

/// Turn captured helper stderr into an error, ignoring the lines the helper
/// prints while starting up normally
pub fn classify_stderr(output: &str) -> Option<TunnelError> {
    let relevant: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !INFORMATIONAL_PREFIXES.iter().any(|p| line.starts_with(p)))
        .collect();

    if relevant.is_empty() {
        return None;
    }

    let message = relevant.join("\n");
    if message.contains(OUTDATED_TOOLING_MARKER) {
        Some(TunnelError::OutdatedTooling(message))
    } else {
        Some(TunnelError::HelperCommandFailed(message))
    }
}

/// Helper stderr, kept only until the tunnel is ready. Later lines are
/// logged and dropped.
struct StderrCapture {
    buffer: Mutex<Option<String>>,
}

impl StderrCapture {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Some(String::new())),
        }
    }

    fn push_line(&self, line: &str) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(buffer) = buffer.as_mut() {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }

    fn snapshot(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    fn stop_buffering(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn capture_stderr(pipe: ChildStderr, capture: Arc<StderrCapture>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(line = %line, "tunnel helper stderr");
                capture.push_line(&line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading tunnel helper stderr");
                break;
            }
        }
    }
}
