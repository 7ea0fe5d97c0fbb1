use base64::Engine;
use chrono::{DateTime, Utc};
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{
    Account, Attachment, ReplyPayload, SentMail, ToolDefinition, ToolInvocationRecord, Turn,
};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        info!("Connected to SQLite at {}", path.display());

        let storage = Self { pool };
        storage.migrate().await?;

        Ok(storage)
    }

    /// Private in-memory database, used by tests and `check-config`.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PostmateError::Storage(e.to_string()))?
            .foreign_keys(true);

        // A single connection that never recycles, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.migrate().await?;

        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        info!("SQLite migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- accounts ----

    /// Inserts or updates an account keyed by its address. The lease timestamp
    /// is never touched here.
    pub async fn upsert_account(&self, account: &Account) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO accounts
                (name, email_address, state, transport, provider, model, language,
                 task, company_info, city, country)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(email_address) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                transport = excluded.transport,
                provider = excluded.provider,
                model = excluded.model,
                language = excluded.language,
                task = excluded.task,
                company_info = excluded.company_info,
                city = excluded.city,
                country = excluded.country
             RETURNING id",
        )
        .bind(&account.name)
        .bind(&account.email_address)
        .bind(account.state.to_string())
        .bind(account.transport.to_string())
        .bind(account.provider.to_string())
        .bind(&account.model)
        .bind(&account.language)
        .bind(&account.task)
        .bind(&account.company_info)
        .bind(&account.city)
        .bind(&account.country)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(id)
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        row.map(Account::try_from).transpose()
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE state = 'active' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        rows.into_iter().map(Account::try_from).collect()
    }

    /// Claims the poll lease for an account. Succeeds only when the previous
    /// poll is at least `cooldown` old; concurrent callers race on a single
    /// conditional update so at most one of them wins.
    pub async fn try_acquire_lease(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let threshold = now_ms - cooldown.as_millis() as i64;

        let result = sqlx::query(
            "UPDATE accounts SET last_polled_at = ?
             WHERE id = ? AND (last_polled_at IS NULL OR last_polled_at <= ?)",
        )
        .bind(now_ms)
        .bind(account_id)
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    // ---- tool definitions ----

    /// Makes the account's tools match `definitions`, keyed by name. Existing
    /// rows are updated in place so their ids, and the invocation records
    /// pointing at them, stay valid. Tools missing from the list are removed.
    pub async fn sync_tool_definitions(
        &self,
        account_id: i64,
        definitions: &[ToolDefinition],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        let existing: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM tool_definitions WHERE account_id = ?")
                .bind(account_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| PostmateError::Storage(e.to_string()))?;
        let mut by_name: HashMap<String, i64> =
            existing.iter().map(|(id, name)| (name.clone(), *id)).collect();
        let mut kept: HashSet<i64> = HashSet::new();

        for def in definitions {
            match by_name.get(&def.name).copied() {
                Some(id) => {
                    sqlx::query(
                        "UPDATE tool_definitions
                         SET description = ?, method = ?, url_template = ?, bearer_token = ?
                         WHERE id = ?",
                    )
                    .bind(&def.description)
                    .bind(def.method.to_string())
                    .bind(&def.url_template)
                    .bind(&def.bearer_token)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PostmateError::Storage(e.to_string()))?;
                    kept.insert(id);
                }
                None => {
                    let done = sqlx::query(
                        "INSERT INTO tool_definitions
                            (account_id, name, description, method, url_template, bearer_token)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(account_id)
                    .bind(&def.name)
                    .bind(&def.description)
                    .bind(def.method.to_string())
                    .bind(&def.url_template)
                    .bind(&def.bearer_token)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PostmateError::Storage(e.to_string()))?;
                    let id = done.last_insert_rowid();
                    by_name.insert(def.name.clone(), id);
                    kept.insert(id);
                }
            }
        }

        for (id, name) in existing.iter().filter(|(id, _)| !kept.contains(id)) {
            debug!("Removing tool {} ({}) from account {}", name, id, account_id);
            sqlx::query("DELETE FROM tool_definitions WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| PostmateError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn list_tool_definitions(&self, account_id: i64) -> Result<Vec<ToolDefinition>> {
        let rows = sqlx::query_as::<_, ToolDefinitionRow>(
            "SELECT * FROM tool_definitions WHERE account_id = ? ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        rows.into_iter().map(ToolDefinition::try_from).collect()
    }

    // ---- turns ----

    pub async fn turn_exists(&self, account_id: i64, message_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM turns WHERE account_id = ? AND message_id = ?",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(count > 0)
    }

    /// Inserts a turn. Returns `None` when a turn for the same account and
    /// message already exists.
    pub async fn create_turn(&self, turn: &Turn) -> Result<Option<i64>> {
        let result = sqlx::query(
            "INSERT INTO turns
                (account_id, message_id, email_from, subject, text, html, prompt, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(turn.account_id)
        .bind(&turn.message_id)
        .bind(&turn.email_from)
        .bind(&turn.subject)
        .bind(&turn.text)
        .bind(&turn.html)
        .bind(&turn.prompt)
        .bind(turn.received_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Some(done.last_insert_rowid())),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(
                    "Turn for message {} of account {} already exists",
                    turn.message_id, turn.account_id
                );
                Ok(None)
            }
            Err(e) => Err(PostmateError::Storage(e.to_string())),
        }
    }

    pub async fn get_turn(&self, turn_id: i64) -> Result<Option<Turn>> {
        let row = sqlx::query_as::<_, TurnRow>("SELECT * FROM turns WHERE id = ?")
            .bind(turn_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(row.map(Turn::from))
    }

    pub async fn update_turn_reply(
        &self,
        turn_id: i64,
        prompt: &str,
        reply: &ReplyPayload,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE turns SET prompt = ?, reply_text = ?, reply_html = ?, reply_subject = ?,
                explanation = ?
             WHERE id = ?",
        )
        .bind(prompt)
        .bind(&reply.text)
        .bind(&reply.html)
        .bind(&reply.subject)
        .bind(&reply.explanation)
        .bind(turn_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Removes a turn so its message is picked up again. Attachments and sent
    /// mail go with it; tool invocation records stay with a null turn.
    pub async fn delete_turn(&self, turn_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM turns WHERE id = ?")
            .bind(turn_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(())
    }

    // ---- tool invocations ----

    pub async fn record_tool_invocation(
        &self,
        tool_id: i64,
        turn_id: Option<i64>,
        parameters: &str,
        result: &str,
        is_error: bool,
    ) -> Result<i64> {
        let done = sqlx::query(
            "INSERT INTO tool_invocations (tool_id, turn_id, parameters, result, is_error, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tool_id)
        .bind(turn_id)
        .bind(parameters)
        .bind(result)
        .bind(is_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(done.last_insert_rowid())
    }

    pub async fn list_tool_invocations(&self, tool_id: i64) -> Result<Vec<ToolInvocationRecord>> {
        let rows = sqlx::query_as::<_, ToolInvocationRow>(
            "SELECT * FROM tool_invocations WHERE tool_id = ? ORDER BY id",
        )
        .bind(tool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(rows.into_iter().map(ToolInvocationRecord::from).collect())
    }

    // ---- attachments ----

    /// Persists a resolved attachment. Path-only attachments are rejected.
    pub async fn save_attachment(&self, turn_id: i64, attachment: &Attachment) -> Result<i64> {
        let content = attachment
            .content
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                PostmateError::Validation(format!(
                    "Attachment {} has no content",
                    attachment.filename
                ))
            })?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| PostmateError::Validation(format!("Attachment {}: {}", attachment.filename, e)))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let done = sqlx::query(
            "INSERT INTO attachments (turn_id, filename, content_type, content, size_bytes, hash)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(turn_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(content)
        .bind(bytes.len() as i64)
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(done.last_insert_rowid())
    }

    pub async fn list_attachments(&self, turn_id: i64) -> Result<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT filename, content_type, content FROM attachments WHERE turn_id = ? ORDER BY id",
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| Attachment {
                filename: r.filename,
                content_type: r.content_type,
                content: Some(r.content),
                path: None,
            })
            .collect())
    }

    // ---- sent mail ----

    pub async fn record_sent_mail(
        &self,
        turn_id: i64,
        receiver: &str,
        subject: &str,
        text: &str,
    ) -> Result<i64> {
        let done = sqlx::query(
            "INSERT INTO sent_mail (turn_id, receiver, subject, text, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(turn_id)
        .bind(receiver)
        .bind(subject)
        .bind(text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(done.last_insert_rowid())
    }

    pub async fn list_sent_mail(&self, turn_id: i64) -> Result<Vec<SentMail>> {
        let rows = sqlx::query_as::<_, SentMailRow>(
            "SELECT * FROM sent_mail WHERE turn_id = ? ORDER BY id",
        )
        .bind(turn_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostmateError::Storage(e.to_string()))?;

        Ok(rows.into_iter().map(SentMail::from).collect())
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    email_address: String,
    state: String,
    transport: String,
    provider: String,
    model: String,
    language: Option<String>,
    task: String,
    company_info: String,
    city: Option<String>,
    country: Option<String>,
    last_polled_at: Option<i64>,
}

impl TryFrom<AccountRow> for Account {
    type Error = PostmateError;

    fn try_from(row: AccountRow) -> Result<Self> {
        let parse_err = |field: &str, value: &str| {
            PostmateError::Storage(format!("Account {}: invalid {} '{}'", row.id, field, value))
        };

        Ok(Account {
            state: row.state.parse().map_err(|_| parse_err("state", &row.state))?,
            transport: row
                .transport
                .parse()
                .map_err(|_| parse_err("transport", &row.transport))?,
            provider: row
                .provider
                .parse()
                .map_err(|_| parse_err("provider", &row.provider))?,
            last_polled_at: row.last_polled_at.and_then(DateTime::from_timestamp_millis),
            id: row.id,
            name: row.name,
            email_address: row.email_address,
            model: row.model,
            language: row.language,
            task: row.task,
            company_info: row.company_info,
            city: row.city,
            country: row.country,
        })
    }
}

#[derive(FromRow)]
struct ToolDefinitionRow {
    id: i64,
    account_id: i64,
    name: String,
    description: String,
    method: String,
    url_template: String,
    bearer_token: Option<String>,
}

impl TryFrom<ToolDefinitionRow> for ToolDefinition {
    type Error = PostmateError;

    fn try_from(row: ToolDefinitionRow) -> Result<Self> {
        let method = row.method.parse().map_err(|_| {
            PostmateError::Storage(format!("Tool {}: invalid method '{}'", row.id, row.method))
        })?;

        Ok(ToolDefinition {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            description: row.description,
            method,
            url_template: row.url_template,
            bearer_token: row.bearer_token,
        })
    }
}

#[derive(FromRow)]
struct TurnRow {
    id: i64,
    account_id: i64,
    message_id: String,
    email_from: String,
    subject: String,
    text: String,
    html: String,
    prompt: String,
    reply_text: Option<String>,
    reply_html: Option<String>,
    reply_subject: Option<String>,
    explanation: Option<String>,
    received_at: DateTime<Utc>,
}

impl From<TurnRow> for Turn {
    fn from(row: TurnRow) -> Self {
        Turn {
            id: row.id,
            account_id: row.account_id,
            message_id: row.message_id,
            email_from: row.email_from,
            subject: row.subject,
            text: row.text,
            html: row.html,
            prompt: row.prompt,
            reply_text: row.reply_text,
            reply_html: row.reply_html,
            reply_subject: row.reply_subject,
            explanation: row.explanation,
            received_at: row.received_at,
        }
    }
}

#[derive(FromRow)]
struct ToolInvocationRow {
    id: i64,
    tool_id: i64,
    turn_id: Option<i64>,
    parameters: String,
    result: String,
    is_error: bool,
    created_at: DateTime<Utc>,
}

impl From<ToolInvocationRow> for ToolInvocationRecord {
    fn from(row: ToolInvocationRow) -> Self {
        ToolInvocationRecord {
            id: row.id,
            tool_id: row.tool_id,
            turn_id: row.turn_id,
            parameters: row.parameters,
            result: row.result,
            is_error: row.is_error,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct AttachmentRow {
    filename: String,
    content_type: String,
    content: String,
}

#[derive(FromRow)]
struct SentMailRow {
    id: i64,
    turn_id: i64,
    receiver: String,
    subject: String,
    text: String,
    created_at: DateTime<Utc>,
}

impl From<SentMailRow> for SentMail {
    fn from(row: SentMailRow) -> Self {
        SentMail {
            id: row.id,
            turn_id: row.turn_id,
            receiver: row.receiver,
            subject: row.subject,
            text: row.text,
            created_at: row.created_at,
        }
    }
}
