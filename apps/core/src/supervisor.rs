use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Keeps console windows from flashing up when the plugin runs `bw` or
/// `netstat` on Windows.
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    Exit { command: String, status: String },
    #[error("failed to terminate process {pid}: {message}")]
    Terminate { pid: u32, message: String },
}

/// OS-level process access. The supervisor only talks to the OS through
/// this seam.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// PID of the process listening on `port`, if any.
    async fn listening_pid(&self, port: u16) -> Result<Option<u32>, SupervisorError>;
    async fn spawn(&self, program: &Path, args: &[String]) -> Result<(), SupervisorError>;
    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError>;
}

/// Starts, detects and stops the `bw serve` process for a port. The
/// supervisor never owns the child: liveness is always re-derived from
/// whoever is listening on the port.
pub struct ProcessSupervisor {
    control: Arc<dyn ProcessControl>,
    executable: PathBuf,
    hostname: String,
}

impl ProcessSupervisor {
    pub fn new(control: Arc<dyn ProcessControl>, executable: PathBuf, hostname: String) -> Self {
        Self {
            control,
            executable,
            hostname,
        }
    }

    pub fn serve_args(&self, port: u16) -> Vec<String> {
        vec![
            "serve".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--hostname".to_string(),
            self.hostname.clone(),
        ]
    }

    /// Probe failures report `false`.
    pub async fn is_running(&self, port: u16) -> bool {
        match self.control.listening_pid(port).await {
            Ok(pid) => pid.is_some(),
            Err(err) => {
                warn!(port, %err, "process probe failed; assuming server is down");
                false
            }
        }
    }

    /// Spawns the server when nothing listens on `port`. Returns whether a
    /// spawn happened. Does not wait for the server to accept connections.
    pub async fn ensure_running(&self, port: u16) -> Result<bool, SupervisorError> {
        if self.is_running(port).await {
            return Ok(false);
        }

        let args = self.serve_args(port);
        self.control.spawn(&self.executable, &args).await?;
        info!(port, executable = %self.executable.display(), "vault server spawned");
        Ok(true)
    }

    pub async fn stop(&self, port: u16) {
        let pid = match self.control.listening_pid(port).await {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                info!(port, "stop requested but no server is listening");
                return;
            }
            Err(err) => {
                warn!(port, %err, "could not resolve server process");
                return;
            }
        };

        match self.control.terminate(pid).await {
            Ok(()) => info!(port, pid, "vault server stopped"),
            Err(err) => warn!(port, pid, %err, "failed to stop vault server"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

#[async_trait]
impl ProcessControl for SystemProcessControl {
    async fn listening_pid(&self, port: u16) -> Result<Option<u32>, SupervisorError> {
        find_listening_pid(port).await
    }

    async fn spawn(&self, program: &Path, args: &[String]) -> Result<(), SupervisorError> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let child = command.spawn().map_err(|source| SupervisorError::Command {
            command: program.display().to_string(),
            source,
        })?;
        debug!(pid = ?child.id(), "spawned child detached");
        Ok(())
    }

    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        terminate_pid(pid).await
    }
}

#[cfg(windows)]
async fn find_listening_pid(port: u16) -> Result<Option<u32>, SupervisorError> {
    // `-p TCP` would list IPv4 sockets only; `localhost` binds `[::1]`.
    let stdout = run_capture("netstat", &["-ano"], false).await?;
    Ok(parse_netstat_pid(&stdout, port))
}

#[cfg(not(windows))]
async fn find_listening_pid(port: u16) -> Result<Option<u32>, SupervisorError> {
    let filter = format!("-iTCP:{port}");
    // lsof exits 1 when nothing matches, which is the common case.
    let stdout = run_capture("lsof", &["-nP", &filter, "-sTCP:LISTEN", "-t"], true).await?;
    Ok(parse_lsof_pid(&stdout))
}

async fn run_capture(program: &str, args: &[&str], allow_failure: bool) -> Result<String, SupervisorError> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    let output = command
        .output()
        .await
        .map_err(|source| SupervisorError::Command {
            command: program.to_string(),
            source,
        })?;

    if !output.status.success() && !allow_failure {
        return Err(SupervisorError::Exit {
            command: program.to_string(),
            status: output.status.to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(windows)]
async fn terminate_pid(pid: u32) -> Result<(), SupervisorError> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(SupervisorError::Terminate {
                pid,
                message: format!("OpenProcess failed: {}", std::io::Error::last_os_error()),
            });
        }
        let terminated = TerminateProcess(handle, 1);
        let last_error = std::io::Error::last_os_error();
        CloseHandle(handle);
        if terminated == 0 {
            return Err(SupervisorError::Terminate {
                pid,
                message: format!("TerminateProcess failed: {last_error}"),
            });
        }
    }
    Ok(())
}

#[cfg(not(windows))]
async fn terminate_pid(pid: u32) -> Result<(), SupervisorError> {
    let status = tokio::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| SupervisorError::Command {
            command: "kill".to_string(),
            source,
        })?;
    if !status.success() {
        return Err(SupervisorError::Terminate {
            pid,
            message: format!("kill exited with {status}"),
        });
    }
    Ok(())
}

/// Finds the owner of a listening TCP socket on `port` in `netstat -ano`
/// output, IPv4 or IPv6. Listeners are recognised by their wildcard foreign
/// address since the state column is localized. PID 0 (the idle process)
/// does not count.
pub fn parse_netstat_pid(stdout: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    stdout.lines().find_map(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        // TCP rows carry a state column; UDP rows have only four.
        let [proto, local, foreign, .., pid] = columns.as_slice() else {
            return None;
        };
        if columns.len() < 5
            || !proto.to_ascii_lowercase().starts_with("tcp")
            || !local.ends_with(&suffix)
            || !is_wildcard_peer(foreign)
        {
            return None;
        }
        pid.parse::<u32>().ok().filter(|pid| *pid != 0)
    })
}

fn is_wildcard_peer(address: &str) -> bool {
    matches!(address, "0.0.0.0:0" | "[::]:0" | "*:*")
}

/// `lsof -t` prints one PID per line.
pub fn parse_lsof_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .find(|pid| *pid != 0)
}
