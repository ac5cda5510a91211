//! The process object: launches one process
//! inside a container (or the guest itself, for the null container id),
//! wires up whichever standard streams it asked for, and tracks its exit
//! code via a background `WaitForProcess` call.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::constants::{hvsock_service_id_for_port, HR_NOT_FOUND, WAIT_TIMEOUT_INFINITE, WINDOWS_GCS_HOST_ID};
use crate::envelope::RequestBase;
use crate::error::{BridgeError, Result};
use crate::guest_connection::GuestConnection;
use crate::io_channel::IoChannel;
use crate::message::{Category, MessageIdentifier, Operation};
use crate::requests::{
    ExecuteProcessRequest, ExecuteProcessResponse, HvsockAddress, HvsockStdioRelaySettings,
    ProcessPipeFlags, ResizeConsoleRequest, SignalProcessRequest, VsockStdioRelaySettings,
    WaitForProcessRequest, WaitForProcessResponse,
};
use crate::transport::merge_request_base;

/// The standard stream channels a process was launched with, whichever the
/// guest-side command line actually requested.
#[derive(Default)]
pub struct ProcessStdio {
    pub stdin: Option<Arc<IoChannel>>,
    pub stdout: Option<Arc<IoChannel>>,
    pub stderr: Option<Arc<IoChannel>>,
}

enum WaitOutcome {
    Pending,
    Exited(i32),
    Failed(BridgeError),
}

/// One process running inside a container (or the guest's pod sandbox,
/// when launched against the null container id).
pub struct Process {
    connection: Arc<GuestConnection>,
    container_id: Uuid,
    process_id: u32,
    stdio: ProcessStdio,
    wait_state: Mutex<WaitOutcome>,
    wait_ready: Notify,
}

impl Process {
    /// Opens I/O channels for whichever of stdin/stdout/stderr `settings`
    /// asks for, issues `ExecuteProcess` with the matching relay addresses,
    /// and on success spawns the background `WaitForProcess` call.
    #[instrument(skip(connection, settings))]
    pub(crate) async fn exec(
        connection: Arc<GuestConnection>,
        container_id: Uuid,
        settings: serde_json::Value,
    ) -> Result<Arc<Process>> {
        let flags: ProcessPipeFlags = serde_json::from_value(settings.clone())?;

        let mut stdio = ProcessStdio::default();
        let mut stdin_port = None;
        let mut stdout_port = None;
        let mut stderr_port = None;

        if flags.create_std_in_pipe {
            let (channel, port) = connection.new_io_channel().await?;
            stdio.stdin = Some(channel);
            stdin_port = Some(port);
        }
        if flags.create_std_out_pipe {
            let (channel, port) = connection.new_io_channel().await?;
            stdio.stdout = Some(channel);
            stdout_port = Some(port);
        }
        if flags.create_std_err_pipe {
            let (channel, port) = connection.new_io_channel().await?;
            stdio.stderr = Some(channel);
            stderr_port = Some(port);
        }

        let has_pipes = stdin_port.is_some() || stdout_port.is_some() || stderr_port.is_some();
        let (vsock, hvsock) = if !has_pipes {
            (None, None)
        } else if connection.os() == "linux" {
            (
                Some(VsockStdioRelaySettings {
                    stdin_port,
                    stdout_port,
                    stderr_port,
                }),
                None,
            )
        } else {
            (
                None,
                Some(HvsockStdioRelaySettings {
                    stdin: stdin_port.map(hvsock_address),
                    stdout: stdout_port.map(hvsock_address),
                    stderr: stderr_port.map(hvsock_address),
                }),
            )
        };

        let base = RequestBase::new(container_id);
        let payload = merge_request_base(
            base,
            serde_json::to_value(ExecuteProcessRequest {
                settings,
                vsock_stdio_relay_settings: vsock,
                hvsock_stdio_relay_settings: hvsock,
            })?,
        )?;

        let response_value = connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::ExecuteProcess),
                payload,
                false,
            )
            .await?;
        let response: ExecuteProcessResponse = serde_json::from_value(response_value)?;

        let process = Arc::new(Process {
            connection,
            container_id,
            process_id: response.process_id,
            stdio,
            wait_state: Mutex::new(WaitOutcome::Pending),
            wait_ready: Notify::new(),
        });

        spawn_waiter(process.clone());

        Ok(process)
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn stdio(&self) -> &ProcessStdio {
        &self.stdio
    }

    /// Terminates the process with the guest's default forceful signal.
    pub async fn kill(&self) -> Result<bool> {
        self.signal(None).await
    }

    /// Delivers `options` (guest- and OS-specific signal/control data) to
    /// the process. `hrNotFound` from the guest means the process had
    /// already exited — reported as `Ok(false)`, not an error.
    #[instrument(skip(self, options))]
    pub async fn signal(&self, options: Option<serde_json::Value>) -> Result<bool> {
        let base = RequestBase::new(self.container_id);
        let payload = merge_request_base(
            base,
            serde_json::to_value(SignalProcessRequest {
                process_id: self.process_id,
                options,
            })?,
        )?;

        match self
            .connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::SignalProcess),
                payload,
                false,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_guest_result(HR_NOT_FOUND) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn resize_console(&self, height: u16, width: u16) -> Result<()> {
        let base = RequestBase::new(self.container_id);
        let payload = merge_request_base(
            base,
            serde_json::to_value(ResizeConsoleRequest {
                process_id: self.process_id,
                height,
                width,
            })?,
        )?;
        self.connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::ResizeConsole),
                payload,
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn close_stdin(&self) -> Result<()> {
        if let Some(channel) = &self.stdio.stdin {
            channel.close_write().await?;
        }
        Ok(())
    }

    pub async fn close_stdout(&self) {
        if let Some(channel) = &self.stdio.stdout {
            channel.close().await;
        }
    }

    pub async fn close_stderr(&self) {
        if let Some(channel) = &self.stdio.stderr {
            channel.close().await;
        }
    }

    /// Closes every open stdio channel for this process.
    pub async fn close(&self) {
        if let Some(channel) = &self.stdio.stdin {
            channel.close().await;
        }
        self.close_stdout().await;
        self.close_stderr().await;
    }

    /// The exit code, once `wait()` (or the background waiter) has
    /// resolved. Returns `NotReady` if the process hasn't exited yet.
    pub fn exit_code(&self) -> Result<i32> {
        match &*self.wait_state.lock().unwrap() {
            WaitOutcome::Pending => Err(BridgeError::NotReady(
                "process has not exited yet".to_string(),
            )),
            WaitOutcome::Exited(code) => Ok(*code),
            WaitOutcome::Failed(err) => Err(err.clone()),
        }
    }

    /// Blocks until the background `WaitForProcess` call resolves.
    pub async fn wait(&self) -> Result<i32> {
        loop {
            let notified = self.wait_ready.notified();
            tokio::pin!(notified);
            {
                let state = self.wait_state.lock().unwrap();
                match &*state {
                    WaitOutcome::Pending => {}
                    WaitOutcome::Exited(code) => return Ok(*code),
                    WaitOutcome::Failed(err) => return Err(err.clone()),
                }
            }
            notified.await;
        }
    }
}

fn hvsock_address(port: u32) -> HvsockAddress {
    HvsockAddress {
        service_id: hvsock_service_id_for_port(port),
        host_id: WINDOWS_GCS_HOST_ID,
    }
}

/// Submits the process's `WaitForProcess` call and resolves `wait()` with
/// its outcome. If submission itself fails (the bridge is already closed),
/// the caller already has a `Process` handle in hand with no way to learn
/// about it except through `wait()`/`exit_code()` — so the failure is
/// folded into the wait state rather than silently dropped.
fn spawn_waiter(process: Arc<Process>) {
    tokio::spawn(async move {
        let base = RequestBase::new(process.container_id);
        let request = WaitForProcessRequest {
            process_id: process.process_id,
            timeout_in_ms: WAIT_TIMEOUT_INFINITE,
        };
        let payload = serde_json::to_value(request)
            .map_err(BridgeError::from)
            .and_then(|extra| merge_request_base(base, extra));
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, process_id = process.process_id, "failed to build WaitForProcess request");
                resolve(&process, WaitOutcome::Failed(err));
                return;
            }
        };

        let result = process
            .connection
            .bridge()
            .rpc(
                &CancellationToken::new(),
                MessageIdentifier::request(Category::Container, Operation::WaitForProcess),
                payload,
                false,
            )
            .await;

        match result {
            Ok(value) => match serde_json::from_value::<WaitForProcessResponse>(value) {
                Ok(response) => resolve(&process, WaitOutcome::Exited(response.exit_code)),
                Err(err) => {
                    let err = BridgeError::from(err);
                    warn!(%err, process_id = process.process_id, "malformed WaitForProcess response");
                    resolve(&process, WaitOutcome::Failed(err));
                }
            },
            Err(err) => {
                warn!(%err, process_id = process.process_id, "WaitForProcess call failed");
                resolve(&process, WaitOutcome::Failed(err));
            }
        }
    });
}

fn resolve(process: &Arc<Process>, outcome: WaitOutcome) {
    let mut state = process.wait_state.lock().unwrap();
    if matches!(&*state, WaitOutcome::Pending) {
        *state = outcome;
    }
    drop(state);
    process.wait_ready.notify_waiters();
}
