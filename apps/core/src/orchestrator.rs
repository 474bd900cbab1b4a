use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::{RefreshState, ResultCache};
use crate::clipboard::ClipboardSink;
use crate::config::Config;
use crate::contract::{
    ActionContext, CopyField, HostCall, PluginRequest, PluginResponse, QueryParams, ResultItem,
};
use crate::menu::MenuBuilder;
use crate::model::ServerState;
use crate::search::FuzzySearchIndex;
use crate::settings::Settings;
use crate::supervisor::ProcessSupervisor;
use crate::vault_client::{VaultApi, VaultError};

/// What a handled request produced: the reply plus any requests the plugin
/// has to send back to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: PluginResponse,
    pub host_calls: Vec<HostCall>,
}

impl Outcome {
    pub fn reply(response: PluginResponse) -> Self {
        Self {
            response,
            host_calls: Vec::new(),
        }
    }

    pub fn with_host_call(response: PluginResponse, call: HostCall) -> Self {
        Self {
            response,
            host_calls: vec![call],
        }
    }
}

/// Seam between the wire protocol and request handling.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn handle(&self, request: PluginRequest) -> Outcome;
    async fn shutdown(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRoute {
    NotLoggedIn,
    AwaitingUnlock,
    Searching(String),
    Menu,
}

/// Decides which screen a query lands on. Search only happens on an unlocked
/// vault when the raw query starts with `"<kw> Search "` (either case of the
/// first letter); the term is every search term after the first.
pub fn route(state: ServerState, query: &QueryParams, keyword: &str) -> QueryRoute {
    match state {
        ServerState::Unauthenticated => QueryRoute::NotLoggedIn,
        ServerState::Locked => QueryRoute::AwaitingUnlock,
        ServerState::Unlocked => {
            let upper = format!("{keyword} Search ");
            let lower = format!("{keyword} search ");
            if query.raw_query.starts_with(&upper) || query.raw_query.starts_with(&lower) {
                let term = query
                    .search_terms
                    .iter()
                    .skip(1)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
                QueryRoute::Searching(term)
            } else {
                QueryRoute::Menu
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub icon_path: String,
    pub login_help_url: String,
    pub readiness_attempts: usize,
    pub stop_server_on_exit: bool,
}

impl From<&Config> for OrchestratorOptions {
    fn from(config: &Config) -> Self {
        Self {
            icon_path: config.icon_path.clone(),
            login_help_url: config.login_help_url.clone(),
            readiness_attempts: config.readiness_attempts,
            stop_server_on_exit: config.stop_server_on_exit,
        }
    }
}

/// Owns every piece of mutable plugin state. One instance serves all
/// requests; each request runs in its own task.
pub struct QueryOrchestrator {
    vault: Arc<dyn VaultApi>,
    supervisor: ProcessSupervisor,
    cache: Arc<ResultCache>,
    index: FuzzySearchIndex,
    clipboard: Arc<dyn ClipboardSink>,
    menu: MenuBuilder,
    last_used: Mutex<Option<ActionContext>>,
    settings: Mutex<Settings>,
    unlock_frame: AtomicUsize,
    readiness_attempts: usize,
    stop_server_on_exit: bool,
}

impl QueryOrchestrator {
    pub fn new(
        vault: Arc<dyn VaultApi>,
        supervisor: ProcessSupervisor,
        clipboard: Arc<dyn ClipboardSink>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            cache: Arc::new(ResultCache::new(Arc::clone(&vault))),
            vault,
            supervisor,
            index: FuzzySearchIndex::default(),
            clipboard,
            menu: MenuBuilder::new(options.icon_path, options.login_help_url),
            last_used: Mutex::new(None),
            settings: Mutex::new(Settings::default()),
            unlock_frame: AtomicUsize::new(0),
            readiness_attempts: options.readiness_attempts,
            stop_server_on_exit: options.stop_server_on_exit,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn settings(&self) -> Settings {
        self.settings_slot().clone()
    }

    pub fn last_used(&self) -> Option<ActionContext> {
        self.last_used_slot().clone()
    }

    pub async fn query(&self, query: &QueryParams, settings: Option<Settings>) -> Vec<ResultItem> {
        if let Some(settings) = settings {
            *self.settings_slot() = settings;
        }
        let settings = self.settings();
        let port = settings.port();

        let state = self.vault.status(port).await;
        if state.is_authenticated() {
            if let Err(err) = self.supervisor.ensure_running(port).await {
                warn!(port, %err, "could not start vault server");
            }
        }

        let refresh_period = match state {
            ServerState::Unlocked => settings.stale_time(),
            _ => None,
        };
        if let RefreshState::Running { period } = self.cache.configure_refresh(refresh_period, port) {
            debug!(period_secs = period.as_secs(), "background refresh active");
        }

        let keyword = if query.action_keyword.trim().is_empty() {
            settings.action_keyword().to_string()
        } else {
            query.action_keyword.clone()
        };

        match route(state, query, &keyword) {
            QueryRoute::NotLoggedIn => self.menu.login_prompt(),
            QueryRoute::AwaitingUnlock => {
                let typed = query.search_terms.first().map(String::as_str);
                let password = typed
                    .filter(|value| !value.is_empty())
                    .or_else(|| settings.stored_password());
                let frame = self.unlock_frame.fetch_add(1, Ordering::Relaxed) % 3 + 1;
                self.menu.unlock_menu(password, port, frame)
            }
            QueryRoute::Searching(term) => {
                match self.search(&term, port, settings.stale_time()).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(%err, "search failed; showing the menu instead");
                        self.menu.main_menu(self.last_used().as_ref(), port)
                    }
                }
            }
            QueryRoute::Menu => self.menu.main_menu(self.last_used().as_ref(), port),
        }
    }

    pub async fn search(
        &self,
        term: &str,
        port: u16,
        stale_time: Option<Duration>,
    ) -> Result<Vec<ResultItem>, VaultError> {
        let items = self.cache.get(port, stale_time).await?;
        let matches = self.index.search(term, &items);
        debug!(term_len = term.len(), matches = matches.len(), "search complete");
        Ok(self.menu.search_results(&matches, port))
    }

    pub fn context_menu(&self, context: Option<&ActionContext>) -> Vec<ResultItem> {
        self.menu.context_menu(context, self.settings().port())
    }

    pub async fn unlock(&self, password: &str, port: u16) {
        let stored = self.settings().stored_password().map(str::to_string);
        let password = if password.is_empty() {
            match stored {
                Some(stored) => stored,
                None => {
                    warn!(port, "unlock requested without a password");
                    return;
                }
            }
        } else {
            password.to_string()
        };

        match self.vault.unlock(port, &password).await {
            Ok(()) => info!(port, "vault unlocked"),
            Err(err) => warn!(port, %err, "unlock failed"),
        }
    }

    pub async fn lock(&self, port: u16) {
        match self.vault.lock(port).await {
            Ok(()) => {
                self.cache.invalidate();
                info!(port, "vault locked");
            }
            Err(err) => warn!(port, %err, "lock failed"),
        }
    }

    pub async fn start_server(&self, port: u16) {
        match self.supervisor.ensure_running(port).await {
            Ok(true) => {
                if self.vault.wait_until_ready(port, self.readiness_attempts).await {
                    info!(port, "vault server ready");
                } else {
                    warn!(port, "vault server did not answer after start");
                }
            }
            Ok(false) => debug!(port, "vault server already running"),
            Err(err) => warn!(port, %err, "could not start vault server"),
        }
    }

    pub async fn stop_server(&self, port: u16) {
        self.supervisor.stop(port).await;
        self.cache.invalidate();
    }

    /// Forgets the last used account, asks the server to sync, then replaces
    /// the cached listing with a fresh one.
    pub async fn reset_all(&self, port: u16) {
        *self.last_used_slot() = None;

        if let Err(err) = self.vault.sync(port).await {
            warn!(port, %err, "vault sync failed");
        }
        self.cache.invalidate();
        match self.cache.refresh(port).await {
            Ok(items) => info!(port, count = items.len(), "vault synced"),
            Err(err) => warn!(port, %err, "listing refetch after sync failed"),
        }
    }

    /// Copies one credential. The account becomes the last used shortcut
    /// only once the clipboard write succeeded.
    pub async fn copy(&self, context: ActionContext, field: CopyField) {
        let value = match field {
            CopyField::Email => context.item.username().map(str::to_string),
            CopyField::Password => context.item.password().map(str::to_string),
            CopyField::Totp => match self.vault.one_time_code(context.port, &context.item.id).await {
                Ok(code) => Some(code),
                Err(err) => {
                    warn!(item = %context.item.id, %err, "one-time code unavailable");
                    None
                }
            },
        };

        let Some(value) = value.filter(|value| !value.is_empty()) else {
            warn!(item = %context.item.id, field = field.as_str(), "nothing to copy");
            return;
        };

        let sink = Arc::clone(&self.clipboard);
        let written = tokio::task::spawn_blocking(move || sink.write_text(&value)).await;
        match written {
            Ok(Ok(())) => {
                debug!(item = %context.item.id, field = field.as_str(), "copied to clipboard");
                *self.last_used_slot() = Some(context);
            }
            Ok(Err(err)) => warn!(%err, "clipboard write failed"),
            Err(err) => warn!(%err, "clipboard task failed"),
        }
    }

    fn port_or_default(&self, port: Option<u16>) -> u16 {
        port.unwrap_or_else(|| self.settings().port())
    }

    fn settings_slot(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn last_used_slot(&self) -> MutexGuard<'_, Option<ActionContext>> {
        self.last_used.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PluginHandler for QueryOrchestrator {
    async fn handle(&self, request: PluginRequest) -> Outcome {
        debug!(method = request.method(), "handling request");
        match request {
            PluginRequest::Initialize { settings } => {
                if let Some(settings) = settings {
                    *self.settings_slot() = settings;
                }
                Outcome::reply(PluginResponse::Empty)
            }
            PluginRequest::Query { query, settings } => {
                Outcome::reply(PluginResponse::results(self.query(&query, settings).await))
            }
            PluginRequest::ContextMenu { context } => {
                Outcome::reply(PluginResponse::results(self.context_menu(context.as_ref())))
            }
            PluginRequest::Login { url } => {
                Outcome::with_host_call(PluginResponse::hide(), HostCall::OpenUrl { url })
            }
            PluginRequest::Unlock { password, port } => {
                self.unlock(&password, self.port_or_default(port)).await;
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::Lock { port } => {
                self.lock(self.port_or_default(port)).await;
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::StartSearch => {
                let keyword = self.settings().action_keyword().to_string();
                Outcome::with_host_call(
                    PluginResponse::keep_open(),
                    HostCall::ChangeQuery {
                        query: format!("{keyword} Search "),
                        requery: true,
                    },
                )
            }
            PluginRequest::StartServer { port } => {
                self.start_server(self.port_or_default(port)).await;
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::StopServer { port } => {
                self.stop_server(self.port_or_default(port)).await;
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::ResetAllCache { port } => {
                self.reset_all(self.port_or_default(port)).await;
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::ResetCache => {
                self.cache.invalidate();
                Outcome::reply(PluginResponse::hide())
            }
            PluginRequest::CopyToClipboard { context, field } => {
                self.copy(context, field).await;
                Outcome::reply(PluginResponse::hide())
            }
        }
    }

    async fn shutdown(&self) {
        self.cache.shutdown();
        if self.stop_server_on_exit {
            let port = self.settings().port();
            self.supervisor.stop(port).await;
        }
        info!("plugin shut down");
    }
}
