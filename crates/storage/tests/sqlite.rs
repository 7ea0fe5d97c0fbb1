use chrono::{Duration as ChronoDuration, Utc};
use postmate_core::types::{
    Account, AccountState, Attachment, HttpMethod, InboundMessage, ProviderKind, ReplyPayload,
    ToolDefinition, TransportKind, Turn,
};
use std::time::Duration;
use storage::sqlite::SqliteStorage;

fn account(email: &str) -> Account {
    Account {
        id: 0,
        name: "Support".into(),
        email_address: email.into(),
        state: AccountState::Active,
        transport: TransportKind::InboundApi,
        provider: ProviderKind::Anthropic,
        model: "claude-opus-4-1".into(),
        language: Some("en".into()),
        task: "Answer customer questions".into(),
        company_info: "ACME Ltd.".into(),
        city: None,
        country: None,
        last_polled_at: None,
    }
}

fn message(id: &str) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        from: "customer@example.org".into(),
        to: vec!["support@example.com".into()],
        subject: "Order".into(),
        text: "Where is my order?".into(),
        html: String::new(),
        received_at: Utc::now(),
    }
}

async fn seeded() -> (SqliteStorage, i64) {
    let store = SqliteStorage::in_memory().await.unwrap();
    let id = store.upsert_account(&account("support@example.com")).await.unwrap();
    (store, id)
}

#[tokio::test]
async fn upsert_account_is_keyed_by_address() {
    let (store, id) = seeded().await;

    let mut changed = account("support@example.com");
    changed.model = "claude-sonnet-4-5".into();
    let again = store.upsert_account(&changed).await.unwrap();
    assert_eq!(id, again);

    let loaded = store.get_account(id).await.unwrap().unwrap();
    assert_eq!(loaded.model, "claude-sonnet-4-5");
    assert_eq!(store.list_active_accounts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn disabled_accounts_are_not_listed() {
    let (store, _) = seeded().await;
    let mut disabled = account("sales@example.com");
    disabled.state = AccountState::Disabled;
    store.upsert_account(&disabled).await.unwrap();

    let active = store.list_active_accounts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].email_address, "support@example.com");
}

#[tokio::test]
async fn lease_respects_cooldown() {
    let (store, id) = seeded().await;
    let cooldown = Duration::from_secs(60);
    let now = Utc::now();

    assert!(store.try_acquire_lease(id, now, cooldown).await.unwrap());
    assert!(!store
        .try_acquire_lease(id, now + ChronoDuration::seconds(30), cooldown)
        .await
        .unwrap());
    assert!(store
        .try_acquire_lease(id, now + ChronoDuration::seconds(61), cooldown)
        .await
        .unwrap());

    let loaded = store.get_account(id).await.unwrap().unwrap();
    assert!(loaded.last_polled_at.is_some());
}

#[tokio::test]
async fn duplicate_turn_is_reported_as_none() {
    let (store, id) = seeded().await;
    let turn = Turn::from_message(id, &message("m-1"));

    let first = store.create_turn(&turn).await.unwrap();
    assert!(first.is_some());
    assert!(store.turn_exists(id, "m-1").await.unwrap());
    assert!(store.create_turn(&turn).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_turn_keeps_tool_invocations() {
    let (store, id) = seeded().await;
    let turn_id = store
        .create_turn(&Turn::from_message(id, &message("m-2")))
        .await
        .unwrap()
        .unwrap();

    store
        .record_tool_invocation(7, Some(turn_id), "{}", "ERROR (500): boom", true)
        .await
        .unwrap();
    store.delete_turn(turn_id).await.unwrap();

    assert!(!store.turn_exists(id, "m-2").await.unwrap());
    let records = store.list_tool_invocations(7).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_error);
    assert_eq!(records[0].turn_id, None);
}

#[tokio::test]
async fn turn_reply_is_updated() {
    let (store, id) = seeded().await;
    let turn_id = store
        .create_turn(&Turn::from_message(id, &message("m-3")))
        .await
        .unwrap()
        .unwrap();

    let reply = ReplyPayload {
        text: "It ships today".into(),
        html: "<p>It ships today</p>".into(),
        subject: "RE: Order".into(),
        explanation: Some("looked it up".into()),
        ..Default::default()
    };
    store.update_turn_reply(turn_id, "system prompt", &reply).await.unwrap();

    let turn = store.get_turn(turn_id).await.unwrap().unwrap();
    assert_eq!(turn.prompt, "system prompt");
    assert_eq!(turn.reply_subject.as_deref(), Some("RE: Order"));
    assert_eq!(turn.explanation.as_deref(), Some("looked it up"));
}

#[tokio::test]
async fn attachments_require_content() {
    let (store, id) = seeded().await;
    let turn_id = store
        .create_turn(&Turn::from_message(id, &message("m-4")))
        .await
        .unwrap()
        .unwrap();

    let path_only = Attachment::from_path("/tmp/report.pdf");
    assert!(store.save_attachment(turn_id, &path_only).await.is_err());

    let resolved = Attachment {
        filename: "hello.txt".into(),
        content_type: "text/plain".into(),
        content: Some("aGVsbG8=".into()),
        path: None,
    };
    store.save_attachment(turn_id, &resolved).await.unwrap();

    let saved = store.list_attachments(turn_id).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content.as_deref(), Some("aGVsbG8="));
}

#[tokio::test]
async fn tool_definitions_are_synced_by_name() {
    let (store, id) = seeded().await;
    let def = ToolDefinition {
        id: 0,
        account_id: id,
        name: "Order Status".into(),
        description: "Look up an order".into(),
        method: HttpMethod::Get,
        url_template: "https://shop.example.com/orders/{orderId}".into(),
        bearer_token: None,
    };
    let stock = ToolDefinition {
        name: "Stock".into(),
        url_template: "https://shop.example.com/stock".into(),
        ..def.clone()
    };

    store.sync_tool_definitions(id, &[def.clone(), def.clone(), stock]).await.unwrap();
    let first = store.list_tool_definitions(id).await.unwrap();
    assert_eq!(first.len(), 2);

    let moved = ToolDefinition {
        url_template: "https://shop.example.com/v2/orders/{orderId}".into(),
        method: HttpMethod::Post,
        ..def
    };
    store.sync_tool_definitions(id, &[moved]).await.unwrap();

    let defs = store.list_tool_definitions(id).await.unwrap();
    assert_eq!(defs.len(), 1);
    // Same row, so earlier invocation records still point at it.
    assert_eq!(defs[0].id, first[0].id);
    assert_eq!(defs[0].method, HttpMethod::Post);
    assert_eq!(defs[0].url_template, "https://shop.example.com/v2/orders/{orderId}");
}

#[tokio::test]
async fn file_database_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStorage::new(dir.path().join("postmate.db")).await.unwrap();
    let id = store.upsert_account(&account("support@example.com")).await.unwrap();
    let turn_id = store
        .create_turn(&Turn::from_message(id, &message("m-5")))
        .await
        .unwrap()
        .unwrap();
    store
        .record_sent_mail(turn_id, "customer@example.org", "RE: Order", "ok")
        .await
        .unwrap();

    assert_eq!(store.list_sent_mail(turn_id).await.unwrap().len(), 1);
}
