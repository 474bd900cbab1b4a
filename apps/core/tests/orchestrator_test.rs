mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bwflow_core::cache::RefreshState;
use bwflow_core::contract::{
    ActionContext, CopyField, HostCall, PluginRequest, PluginResponse, ResultItem,
};
use bwflow_core::model::ServerState;
use bwflow_core::orchestrator::{route, PluginHandler, QueryRoute};
use bwflow_core::settings::{CacheTtl, Settings};
use common::{
    orchestrator, query, sample_items, FakeProcessControl, FakeVault, MemoryClipboard, HELP_URL,
    PORT,
};
use serde_json::json;

fn titles(rows: &[ResultItem]) -> Vec<&str> {
    rows.iter().map(|row| row.title.as_str()).collect()
}

fn scores(rows: &[ResultItem]) -> Vec<Option<u32>> {
    rows.iter().map(|row| row.score).collect()
}

fn results(response: PluginResponse) -> Vec<ResultItem> {
    match response {
        PluginResponse::Results { result } => result,
        other => panic!("expected results, got {other:?}"),
    }
}

fn github_context() -> ActionContext {
    ActionContext {
        item: sample_items().remove(0),
        score: 90,
        port: PORT,
    }
}

#[test]
fn routes_follow_server_state_and_search_prefix() {
    let search = query("bw Search git hub");
    assert_eq!(route(ServerState::Unauthenticated, &search, "bw"), QueryRoute::NotLoggedIn);
    assert_eq!(route(ServerState::Locked, &search, "bw"), QueryRoute::AwaitingUnlock);
    assert_eq!(
        route(ServerState::Unlocked, &search, "bw"),
        QueryRoute::Searching("git hub".into())
    );
    assert_eq!(
        route(ServerState::Unlocked, &query("bw search git"), "bw"),
        QueryRoute::Searching("git".into())
    );
    assert_eq!(route(ServerState::Unlocked, &query("bw Searchgit"), "bw"), QueryRoute::Menu);
    assert_eq!(route(ServerState::Unlocked, &query("bw Search"), "bw"), QueryRoute::Menu);
    assert_eq!(route(ServerState::Unlocked, &query("pw Search git"), "bw"), QueryRoute::Menu);
}

#[tokio::test]
async fn unauthenticated_shows_login_prompt_even_when_searching() {
    let vault = FakeVault::new(ServerState::Unauthenticated, sample_items());
    let control = FakeProcessControl::stopped();
    let orchestrator = orchestrator(vault.clone(), control.clone(), Arc::default());

    let rows = orchestrator.query(&query("bw Search git"), None).await;

    assert_eq!(titles(&rows), vec!["You are not logged in"]);
    assert_eq!(rows[0].action.method, "bw_login");
    assert_eq!(rows[0].action.parameters, vec![json!(HELP_URL)]);
    assert_eq!(rows[0].score, Some(100));
    assert_eq!(vault.list_calls(), 0);
    assert_eq!(control.spawn_count(), 0);
}

#[tokio::test]
async fn locked_vault_offers_unlock_and_starts_the_server() {
    let vault = FakeVault::new(ServerState::Locked, sample_items());
    let control = FakeProcessControl::stopped();
    let orchestrator = orchestrator(vault.clone(), control.clone(), Arc::default());

    let rows = orchestrator.query(&query("bw hunter2"), None).await;

    assert_eq!(titles(&rows), vec!["Unlock", "Stop server"]);
    assert_eq!(scores(&rows), vec![Some(100), Some(25)]);
    assert_eq!(rows[0].action.method, "bw_unlock");
    assert_eq!(rows[0].action.parameters, vec![json!("hunter2"), json!("58765")]);
    assert_eq!(rows[1].action.method, "stop_bw_server");
    assert_eq!(control.spawn_count(), 1);
    assert_eq!(vault.list_calls(), 0);
}

#[tokio::test]
async fn running_server_is_not_spawned_again() {
    let vault = FakeVault::new(ServerState::Locked, sample_items());
    let control = FakeProcessControl::running(77);
    let orchestrator = orchestrator(vault, control.clone(), Arc::default());

    orchestrator.query(&query("bw "), None).await;
    orchestrator.query(&query("bw "), None).await;

    assert_eq!(control.spawn_count(), 0);
}

#[tokio::test]
async fn unlock_row_falls_back_to_stored_password_and_animates() {
    let vault = FakeVault::new(ServerState::Locked, sample_items());
    let orchestrator = orchestrator(vault, FakeProcessControl::running(1), Arc::default());
    let settings = Settings {
        password: Some("stored".into()),
        ..Settings::default()
    };

    let mut subtitles = Vec::new();
    for _ in 0..4 {
        let rows = orchestrator.query(&query("bw "), Some(settings.clone())).await;
        assert_eq!(rows[0].action.parameters[0], json!("stored"));
        subtitles.push(rows[0].subtitle.clone());
    }

    let dots: Vec<usize> = subtitles
        .iter()
        .map(|s| s.len() - s.trim_end_matches('.').len())
        .collect();
    // The sentence itself ends with one period.
    assert_eq!(dots, vec![2, 3, 4, 2]);
}

#[tokio::test]
async fn unlocked_menu_without_last_used() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let orchestrator = orchestrator(vault, FakeProcessControl::running(1), Arc::default());

    let rows = orchestrator.query(&query("bw "), None).await;

    assert_eq!(
        titles(&rows),
        vec!["Search", "Lock vault", "Sync vault", "Stop server"]
    );
    assert_eq!(scores(&rows), vec![Some(100), Some(60), Some(50), Some(25)]);
    assert_eq!(rows[0].action.method, "bw_start_search");
    assert_eq!(rows[1].action.method, "bw_lock");
    assert_eq!(rows[2].action.method, "reset_all_cache");
    assert_eq!(rows[2].action.parameters, vec![json!("58765")]);
}

#[tokio::test]
async fn search_prefix_returns_ranked_accounts() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let orchestrator = orchestrator(vault.clone(), FakeProcessControl::running(1), Arc::default());

    let rows = orchestrator.query(&query("bw Search github"), None).await;

    assert_eq!(titles(&rows)[0], "GitHub");
    let top = &rows[0];
    assert_eq!(top.subtitle, "octocat | enter copy to clipboard, → for more");
    assert_eq!(top.action.method, "copy_to_clipboard");
    assert_eq!(top.action.parameters[1], json!("password"));
    assert!(top.score.unwrap() > 90);

    let context: ActionContext =
        serde_json::from_value(top.context_data.as_ref().unwrap()[0].clone()).unwrap();
    assert_eq!(context.item.id, "1");
    assert_eq!(context.port, PORT);

    orchestrator.query(&query("bw Search gmail"), None).await;
    assert_eq!(vault.list_calls(), 1);
}

#[tokio::test]
async fn failed_search_falls_back_to_the_menu() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    vault.fail_listing.store(true, Ordering::SeqCst);
    let orchestrator = orchestrator(vault, FakeProcessControl::running(1), Arc::default());

    let rows = orchestrator.query(&query("bw Search github"), None).await;

    assert_eq!(titles(&rows)[0], "Search");
    assert_eq!(rows.len(), 4);
}

#[tokio::test]
async fn copy_sets_last_used_shortcut_on_the_menu() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let clipboard = Arc::new(MemoryClipboard::default());
    let orchestrator = orchestrator(vault, FakeProcessControl::running(1), clipboard.clone());

    let outcome = orchestrator
        .handle(PluginRequest::CopyToClipboard {
            context: github_context(),
            field: CopyField::Password,
        })
        .await;
    assert_eq!(outcome.response, PluginResponse::hide());
    assert_eq!(clipboard.last().as_deref(), Some("gh-secret"));

    let rows = orchestrator.query(&query("bw "), None).await;
    assert_eq!(
        titles(&rows),
        vec!["GitHub", "Search", "Lock vault", "Sync vault", "Stop server"]
    );
    assert_eq!(
        scores(&rows),
        vec![Some(100), Some(50), Some(45), Some(35), Some(25)]
    );
    assert_eq!(rows[0].action.method, "copy_to_clipboard");
}

#[tokio::test]
async fn copy_username_and_one_time_code() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    *vault.totp_code.lock().unwrap() = Some("123456".into());
    let clipboard = Arc::new(MemoryClipboard::default());
    let orchestrator = orchestrator(vault, FakeProcessControl::running(1), clipboard.clone());

    orchestrator.copy(github_context(), CopyField::Email).await;
    assert_eq!(clipboard.last().as_deref(), Some("octocat"));

    orchestrator.copy(github_context(), CopyField::Totp).await;
    assert_eq!(clipboard.last().as_deref(), Some("123456"));
}

#[tokio::test]
async fn failed_copy_leaves_last_used_untouched() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let clipboard = Arc::new(MemoryClipboard::default());
    clipboard.fail.store(true, Ordering::SeqCst);
    let orchestrator = orchestrator(vault.clone(), FakeProcessControl::running(1), clipboard);

    orchestrator.copy(github_context(), CopyField::Password).await;
    assert!(orchestrator.last_used().is_none());

    // No code available: nothing is written and nothing is remembered.
    orchestrator.copy(github_context(), CopyField::Totp).await;
    assert!(orchestrator.last_used().is_none());
}

#[tokio::test]
async fn reset_all_cache_syncs_refetches_and_forgets_last_used() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let orchestrator = orchestrator(
        vault.clone(),
        FakeProcessControl::running(1),
        Arc::default(),
    );
    orchestrator.copy(github_context(), CopyField::Password).await;
    orchestrator.query(&query("bw Search git"), None).await;
    assert!(orchestrator.last_used().is_some());

    orchestrator
        .handle(PluginRequest::ResetAllCache { port: Some(PORT) })
        .await;

    assert!(orchestrator.last_used().is_none());
    assert_eq!(vault.sync_calls.load(Ordering::SeqCst), 1);
    assert_eq!(vault.list_calls(), 2);
    assert!(orchestrator.cache().current().is_some());
}

#[tokio::test]
async fn reset_cache_only_invalidates() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let orchestrator = orchestrator(vault.clone(), FakeProcessControl::running(1), Arc::default());
    orchestrator.query(&query("bw Search git"), None).await;

    orchestrator.handle(PluginRequest::ResetCache).await;

    assert!(orchestrator.cache().current().is_none());
    assert_eq!(vault.sync_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn context_menu_lists_copy_actions() {
    let orchestrator = orchestrator(
        FakeVault::new(ServerState::Unlocked, sample_items()),
        FakeProcessControl::running(1),
        Arc::default(),
    );

    let with_totp = results(
        orchestrator
            .handle(PluginRequest::ContextMenu {
                context: Some(github_context()),
            })
            .await
            .response,
    );
    assert_eq!(titles(&with_totp), vec!["Username", "Password", "2FA", "Sync vault"]);
    assert_eq!(with_totp[0].action.parameters[1], json!("email"));
    assert_eq!(with_totp[2].action.parameters[1], json!("totp"));

    let mut plain = github_context();
    plain.item = sample_items().remove(1);
    let without_totp = orchestrator.context_menu(Some(&plain));
    assert_eq!(titles(&without_totp), vec!["Username", "Password", "Sync vault"]);

    let no_context = orchestrator.context_menu(None);
    assert_eq!(
        titles(&no_context),
        vec!["Reset current session cache", "Sync vault"]
    );
    assert_eq!(no_context[0].action.method, "reset_cache");
}

#[tokio::test]
async fn login_and_start_search_talk_to_the_host() {
    let orchestrator = orchestrator(
        FakeVault::new(ServerState::Unlocked, sample_items()),
        FakeProcessControl::running(1),
        Arc::default(),
    );

    let login = orchestrator
        .handle(PluginRequest::Login {
            url: HELP_URL.into(),
        })
        .await;
    assert_eq!(login.response, PluginResponse::hide());
    assert_eq!(
        login.host_calls,
        vec![HostCall::OpenUrl {
            url: HELP_URL.into()
        }]
    );

    let search = orchestrator.handle(PluginRequest::StartSearch).await;
    assert_eq!(search.response, PluginResponse::keep_open());
    assert_eq!(
        search.host_calls,
        vec![HostCall::ChangeQuery {
            query: "bw Search ".into(),
            requery: true
        }]
    );
}

#[tokio::test]
async fn unlock_and_lock_reach_the_vault() {
    let vault = FakeVault::new(ServerState::Locked, sample_items());
    let orchestrator = orchestrator(vault.clone(), FakeProcessControl::running(1), Arc::default());

    orchestrator
        .handle(PluginRequest::Unlock {
            password: "typed".into(),
            port: None,
        })
        .await;
    orchestrator
        .handle(PluginRequest::Unlock {
            password: String::new(),
            port: Some(PORT),
        })
        .await;
    orchestrator.handle(PluginRequest::Lock { port: None }).await;

    assert_eq!(*vault.unlock_passwords.lock().unwrap(), vec!["typed".to_string()]);
    assert_eq!(vault.lock_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_and_stop_server() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let control = FakeProcessControl::stopped();
    let orchestrator = orchestrator(vault.clone(), control.clone(), Arc::default());

    orchestrator
        .handle(PluginRequest::StartServer { port: None })
        .await;
    assert_eq!(control.spawn_count(), 1);
    assert_eq!(vault.ready_checks.load(Ordering::SeqCst), 1);

    orchestrator
        .handle(PluginRequest::StopServer { port: Some(PORT) })
        .await;
    assert_eq!(*control.terminated.lock().unwrap(), vec![4242]);
}

#[tokio::test]
async fn query_settings_drive_the_refresh_timer() {
    let vault = FakeVault::new(ServerState::Unlocked, sample_items());
    let orchestrator = orchestrator(vault.clone(), FakeProcessControl::running(1), Arc::default());

    let hourly = Settings {
        cache_ttl: CacheTtl::OneHour,
        ..Settings::default()
    };
    orchestrator.query(&query("bw "), Some(hourly)).await;
    assert_eq!(
        orchestrator.cache().refresh_state(),
        RefreshState::Running {
            period: Duration::from_secs(3600)
        }
    );

    let forever = Settings {
        cache_ttl: CacheTtl::Indefinite,
        ..Settings::default()
    };
    orchestrator.query(&query("bw "), Some(forever)).await;
    assert_eq!(orchestrator.cache().refresh_state(), RefreshState::Idle);

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.cache().refresh_state(), RefreshState::Idle);
}

#[tokio::test]
async fn custom_port_from_settings_is_used() {
    let vault = FakeVault::new(ServerState::Locked, sample_items());
    let control = FakeProcessControl::stopped();
    let orchestrator = orchestrator(vault, control.clone(), Arc::default());
    let settings = Settings {
        server_port: Some("9000".into()),
        ..Settings::default()
    };

    let rows = orchestrator.query(&query("bw "), Some(settings)).await;

    assert_eq!(rows[0].action.parameters[1], json!("9000"));
    let spawned = control.spawned.lock().unwrap();
    assert_eq!(spawned[0].1[2], "9000");
}
