//! Copies accounts declared in the settings file into the store.

use postmate_core::config::{AccountSeed, ToolSeed};
use postmate_core::error::Result;
use postmate_core::types::{Account, ToolDefinition};
use storage::sqlite::SqliteStorage;
use tracing::info;

pub fn account_from_seed(seed: &AccountSeed) -> Account {
    Account {
        id: 0,
        name: seed.name.clone(),
        email_address: seed.email_address.trim().to_string(),
        state: seed.state,
        transport: seed.transport,
        provider: seed.provider,
        model: seed.model.clone(),
        language: seed.language.clone(),
        task: seed.task.clone(),
        company_info: seed.company_info.clone(),
        city: seed.city.clone(),
        country: seed.country.clone(),
        last_polled_at: None,
    }
}

fn tool_from_seed(account_id: i64, seed: &ToolSeed) -> ToolDefinition {
    ToolDefinition {
        id: 0,
        account_id,
        name: seed.name.clone(),
        description: seed.description.clone(),
        method: seed.method,
        url_template: seed.url.clone(),
        bearer_token: seed.bearer_token.clone(),
    }
}

/// Upserts every seed by address. Tool lists are replaced only for seeds
/// that declare tools, so definitions managed elsewhere survive a restart.
pub async fn seed_accounts(storage: &SqliteStorage, seeds: &[AccountSeed]) -> Result<usize> {
    for seed in seeds {
        let account_id = storage.upsert_account(&account_from_seed(seed)).await?;
        if !seed.tools.is_empty() {
            let tools: Vec<ToolDefinition> = seed
                .tools
                .iter()
                .map(|t| tool_from_seed(account_id, t))
                .collect();
            storage.sync_tool_definitions(account_id, &tools).await?;
        }
        info!(
            account_id,
            "Seeded account {} with {} tools",
            seed.email_address,
            seed.tools.len()
        );
    }
    Ok(seeds.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postmate_core::config::Settings;

    const SETTINGS: &str = r#"
[[accounts]]
name = "Support"
email_address = "support@acme.test"
model = "claude-opus-4-1"

[[accounts.tools]]
name = "order status"
description = "Look up an order"
method = "GET"
url = "https://shop.acme.test/orders/{orderId}"

[[accounts]]
name = "Sales"
email_address = "sales@acme.test"
model = "claude-sonnet-4-5"
state = "disabled"
"#;

    #[tokio::test]
    async fn seeds_accounts_and_tools() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        let store = SqliteStorage::in_memory().await.unwrap();

        assert_eq!(seed_accounts(&store, &settings.accounts).await.unwrap(), 2);
        // Seeding twice keeps one row per address.
        seed_accounts(&store, &settings.accounts).await.unwrap();

        let active = store.list_active_accounts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].email_address, "support@acme.test");

        let tools = store.list_tool_definitions(active[0].id).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].url_template, "https://shop.acme.test/orders/{orderId}");
    }

    #[tokio::test]
    async fn seeds_without_tools_keep_stored_definitions() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        let store = SqliteStorage::in_memory().await.unwrap();
        seed_accounts(&store, &settings.accounts).await.unwrap();

        let mut without_tools = settings.accounts.clone();
        without_tools[0].tools.clear();
        seed_accounts(&store, &without_tools).await.unwrap();

        let active = store.list_active_accounts().await.unwrap();
        assert_eq!(store.list_tool_definitions(active[0].id).await.unwrap().len(), 1);
    }
}
