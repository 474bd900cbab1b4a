#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bwflow_core::clipboard::{ClipboardError, ClipboardSink};
use bwflow_core::contract::QueryParams;
use bwflow_core::model::{ServerState, VaultItem};
use bwflow_core::orchestrator::{OrchestratorOptions, QueryOrchestrator};
use bwflow_core::supervisor::{ProcessControl, ProcessSupervisor, SupervisorError};
use bwflow_core::vault_client::{VaultApi, VaultError};

pub const PORT: u16 = 58765;
pub const HELP_URL: &str = "https://github.com/Etheirystech/Flow-Launcher-Bitwarden-Plugin";

pub struct FakeVault {
    pub state: Mutex<ServerState>,
    pub items: Mutex<Vec<VaultItem>>,
    pub list_delay: Mutex<Duration>,
    pub fail_listing: AtomicBool,
    pub list_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
    pub lock_calls: AtomicUsize,
    pub ready_checks: AtomicUsize,
    pub unlock_passwords: Mutex<Vec<String>>,
    pub totp_code: Mutex<Option<String>>,
}

impl FakeVault {
    pub fn new(state: ServerState, items: Vec<VaultItem>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            items: Mutex::new(items),
            list_delay: Mutex::new(Duration::ZERO),
            fail_listing: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            lock_calls: AtomicUsize::new(0),
            ready_checks: AtomicUsize::new(0),
            unlock_passwords: Mutex::new(Vec::new()),
            totp_code: Mutex::new(None),
        })
    }

    pub fn set_items(&self, items: Vec<VaultItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VaultApi for FakeVault {
    async fn status(&self, _port: u16) -> ServerState {
        *self.state.lock().unwrap()
    }

    async fn unlock(&self, _port: u16, password: &str) -> Result<(), VaultError> {
        self.unlock_passwords.lock().unwrap().push(password.to_string());
        Ok(())
    }

    async fn lock(&self, _port: u16) -> Result<(), VaultError> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn one_time_code(&self, _port: u16, _item_id: &str) -> Result<String, VaultError> {
        self.totp_code
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| VaultError::Rejected("no totp".into()))
    }

    async fn list_items(&self, _port: u16) -> Result<Vec<VaultItem>, VaultError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(VaultError::Rejected("listing failed".into()));
        }
        Ok(self.items.lock().unwrap().clone())
    }

    async fn sync(&self, _port: u16) -> Result<(), VaultError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_until_ready(&self, _port: u16, _max_attempts: usize) -> bool {
        self.ready_checks.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[derive(Default)]
pub struct FakeProcessControl {
    pub listening: Mutex<Option<u32>>,
    pub probe_fails: AtomicBool,
    pub terminate_fails: AtomicBool,
    pub spawned: Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub terminated: Mutex<Vec<u32>>,
}

impl FakeProcessControl {
    pub fn running(pid: u32) -> Arc<Self> {
        let control = Self::default();
        *control.listening.lock().unwrap() = Some(pid);
        Arc::new(control)
    }

    pub fn stopped() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn listening_pid(&self, _port: u16) -> Result<Option<u32>, SupervisorError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(SupervisorError::Exit {
                command: "netstat".into(),
                status: "exit code: 1".into(),
            });
        }
        Ok(*self.listening.lock().unwrap())
    }

    async fn spawn(&self, program: &Path, args: &[String]) -> Result<(), SupervisorError> {
        self.spawned
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));
        *self.listening.lock().unwrap() = Some(4242);
        Ok(())
    }

    async fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        if self.terminate_fails.load(Ordering::SeqCst) {
            return Err(SupervisorError::Terminate {
                pid,
                message: "access denied".into(),
            });
        }
        self.terminated.lock().unwrap().push(pid);
        *self.listening.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryClipboard {
    pub writes: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl MemoryClipboard {
    pub fn last(&self) -> Option<String> {
        self.writes.lock().unwrap().last().cloned()
    }
}

impl ClipboardSink for MemoryClipboard {
    fn write_text(&self, value: &str) -> Result<(), ClipboardError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClipboardError::Open);
        }
        self.writes.lock().unwrap().push(value.to_string());
        Ok(())
    }
}

pub fn supervisor(control: Arc<FakeProcessControl>) -> ProcessSupervisor {
    ProcessSupervisor::new(control, PathBuf::from("bw"), "localhost".to_string())
}

pub fn orchestrator(
    vault: Arc<FakeVault>,
    control: Arc<FakeProcessControl>,
    clipboard: Arc<MemoryClipboard>,
) -> QueryOrchestrator {
    QueryOrchestrator::new(
        vault,
        supervisor(control),
        clipboard,
        OrchestratorOptions {
            icon_path: "./icon.png".to_string(),
            login_help_url: HELP_URL.to_string(),
            readiness_attempts: 3,
            stop_server_on_exit: false,
        },
    )
}

/// Builds the query payload the launcher sends for `raw`, e.g.
/// `"bw Search git"`.
pub fn query(raw: &str) -> QueryParams {
    let (keyword, search) = raw.split_once(' ').unwrap_or((raw, ""));
    QueryParams {
        search: search.to_string(),
        search_terms: search.split_whitespace().map(str::to_string).collect(),
        action_keyword: keyword.to_string(),
        raw_query: raw.to_string(),
    }
}

pub fn sample_items() -> Vec<VaultItem> {
    vec![
        VaultItem::new("1", "GitHub", Some("octocat"), Some("gh-secret")).with_totp("JBSWY3DPEHPK3PXP"),
        VaultItem::new("2", "Gmail", Some("someone@example.com"), Some("mail-secret")),
        VaultItem::new("3", "Bank", Some("saver"), Some("bank-secret")),
    ]
}
