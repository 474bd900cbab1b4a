use serde_json::Value;

use crate::contract::{ActionContext, CopyField, JsonRpcAction, ResultItem};
use crate::search::{display_score, SearchMatch};

const SYNC_SUBTITLE: &str = "Press enter to sync the vault. Sync will be complete when flow closes";
const STOP_SUBTITLE: &str = "Press enter to stop the server.";

/// Builds the result rows the launcher renders. Pure: every input comes in
/// as an argument, so the orchestrator decides *what* to show and this
/// module only decides *how* it looks.
#[derive(Debug, Clone)]
pub struct MenuBuilder {
    icon_path: String,
    login_help_url: String,
}

impl MenuBuilder {
    pub fn new(icon_path: impl Into<String>, login_help_url: impl Into<String>) -> Self {
        Self {
            icon_path: icon_path.into(),
            login_help_url: login_help_url.into(),
        }
    }

    pub fn login_prompt(&self) -> Vec<ResultItem> {
        vec![self.row(
            "You are not logged in",
            "Press enter to go to the page for instructions on how to login.",
            "bw_login",
            vec![Value::from(self.login_help_url.as_str())],
            Some(100),
        )]
    }

    /// `dots` is the loading animation frame (1 to 3 dots).
    pub fn unlock_menu(&self, password: Option<&str>, port: u16, dots: usize) -> Vec<ResultItem> {
        let password = password.map(Value::from).unwrap_or(Value::Null);
        vec![
            self.row(
                "Unlock",
                &format!(
                    "Enter your password and press enter to unlock the vault.{}",
                    ".".repeat(dots)
                ),
                "bw_unlock",
                vec![password, port_value(port)],
                Some(100),
            ),
            self.stop_server(port, 25),
        ]
    }

    pub fn main_menu(&self, last_used: Option<&ActionContext>, port: u16) -> Vec<ResultItem> {
        let (search, lock, sync) = if last_used.is_some() {
            (50, 45, 35)
        } else {
            (100, 60, 50)
        };

        let mut rows = Vec::with_capacity(5);
        if let Some(context) = last_used {
            rows.push(self.account_row(context, Some(100)));
        }
        rows.push(self.row(
            "Search",
            "Press enter and start searching",
            "bw_start_search",
            Vec::new(),
            Some(search),
        ));
        rows.push(self.row(
            "Lock vault",
            "Press enter to lock the vault",
            "bw_lock",
            vec![port_value(port)],
            Some(lock),
        ));
        rows.push(self.sync_vault(port, Some(sync)));
        rows.push(self.stop_server(port, 25));
        rows
    }

    pub fn search_results(&self, matches: &[SearchMatch], port: u16) -> Vec<ResultItem> {
        matches
            .iter()
            .map(|found| {
                let score = display_score(found.distance);
                let context = ActionContext {
                    item: found.item.clone(),
                    score,
                    port,
                };
                self.account_row(&context, Some(score))
            })
            .collect()
    }

    pub fn context_menu(&self, context: Option<&ActionContext>, fallback_port: u16) -> Vec<ResultItem> {
        let Some(context) = context else {
            return vec![
                self.row(
                    "Reset current session cache",
                    SYNC_SUBTITLE,
                    "reset_cache",
                    Vec::new(),
                    None,
                ),
                self.sync_vault(fallback_port, None),
            ];
        };

        let mut rows = vec![
            self.copy_row("Username", "Copy username", context, CopyField::Email),
            self.copy_row("Password", "Copy password", context, CopyField::Password),
        ];
        if context.item.has_totp() {
            rows.push(self.copy_row("2FA", "Copy 2FA", context, CopyField::Totp));
        }
        rows.push(self.sync_vault(context.port, None));
        rows
    }

    /// Row for one vault account; the default action copies the password.
    pub fn account_row(&self, context: &ActionContext, score: Option<u32>) -> ResultItem {
        let subtitle = context
            .item
            .username()
            .map(|username| format!("{username} | enter copy to clipboard, → for more"))
            .unwrap_or_default();
        let mut row = self.copy_row(&context.item.name, &subtitle, context, CopyField::Password);
        row.score = score;
        row.context_data = Some(vec![context_value(context)]);
        row
    }

    fn copy_row(&self, title: &str, subtitle: &str, context: &ActionContext, field: CopyField) -> ResultItem {
        self.row(
            title,
            subtitle,
            "copy_to_clipboard",
            vec![context_value(context), Value::from(field.as_str())],
            None,
        )
    }

    fn sync_vault(&self, port: u16, score: Option<u32>) -> ResultItem {
        self.row(
            "Sync vault",
            SYNC_SUBTITLE,
            "reset_all_cache",
            vec![port_value(port)],
            score,
        )
    }

    fn stop_server(&self, port: u16, score: u32) -> ResultItem {
        self.row(
            "Stop server",
            STOP_SUBTITLE,
            "stop_bw_server",
            vec![port_value(port)],
            Some(score),
        )
    }

    fn row(
        &self,
        title: &str,
        subtitle: &str,
        method: &str,
        parameters: Vec<Value>,
        score: Option<u32>,
    ) -> ResultItem {
        ResultItem {
            title: title.to_string(),
            subtitle: subtitle.to_string(),
            action: JsonRpcAction {
                method: method.to_string(),
                parameters,
            },
            icon_path: self.icon_path.clone(),
            score,
            context_data: None,
        }
    }
}

fn port_value(port: u16) -> Value {
    Value::from(port.to_string())
}

fn context_value(context: &ActionContext) -> Value {
    serde_json::to_value(context).unwrap_or(Value::Null)
}
