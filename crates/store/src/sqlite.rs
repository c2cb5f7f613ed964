//! SQLite entity store.
//!
//! Three tables: `agents`, `chains` and `function_calls`. Messages, tool
//! schemas and results are stored as JSON text and decoded at this
//! boundary. Timestamps are RFC 3339 strings with fixed microsecond
//! precision, so string comparison orders them chronologically.
//!
//! Multi-statement writes run in a transaction whose first statement is a
//! write, which takes SQLite's write lock up front instead of upgrading a
//! read snapshot halfway through.

use agentchain_core::agent::{AgentDefinition, AgentRecord};
use agentchain_core::chain::{
    AgentId, Chain, ChainId, ChainStatus, ChainSummary, FunctionCall, FunctionCallId, Lease,
    NewChain, duplicate_call_result, order_by_invocation,
};
use agentchain_core::error::StoreError;
use agentchain_core::message::{Message, MessageToolCall};
use agentchain_core::store::{ChainStore, status_after};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// A SQLite-backed [`ChainStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database lives and dies with its connection, so the
        // pool holds exactly one and never recycles it.
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite chain store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id                          INTEGER PRIMARY KEY AUTOINCREMENT,
                name                        TEXT NOT NULL UNIQUE,
                system_prompt               TEXT NOT NULL,
                tools                       TEXT NOT NULL DEFAULT '[]',
                delegation_tool_name        TEXT NOT NULL,
                delegation_tool_description TEXT NOT NULL,
                created_at                  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("agents table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chains (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                messages                TEXT NOT NULL DEFAULT '[]',
                agent_id                INTEGER NOT NULL REFERENCES agents(id),
                status                  TEXT NOT NULL,
                parent_function_call_id INTEGER REFERENCES function_calls(id),
                claimed_at              TEXT,
                claim_epoch             INTEGER NOT NULL DEFAULT 0,
                dispatch_attempts       INTEGER NOT NULL DEFAULT 0,
                retry_after             TEXT,
                created_at              TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("chains table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS function_calls (
                id                        INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id                  INTEGER NOT NULL REFERENCES chains(id),
                external_function_call_id TEXT NOT NULL,
                function_name             TEXT NOT NULL,
                function_args             TEXT NOT NULL,
                result                    TEXT,
                added_to_chain_at         TEXT,
                child_chain_id            INTEGER REFERENCES chains(id),
                created_at                TEXT NOT NULL,
                UNIQUE (chain_id, external_function_call_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("function_calls table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chains_status ON chains(status, created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("status index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chains_parent ON chains(parent_function_call_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("parent index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_agent(row: &SqliteRow) -> Result<AgentRecord, StoreError> {
        let tools: String = col(row, "tools")?;
        let created_at: String = col(row, "created_at")?;
        Ok(AgentRecord {
            id: AgentId(col(row, "id")?),
            name: col(row, "name")?,
            system_prompt: col(row, "system_prompt")?,
            tools: decode_json("agent tools", &tools)?,
            delegation_tool_name: col(row, "delegation_tool_name")?,
            delegation_tool_description: col(row, "delegation_tool_description")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_chain(row: &SqliteRow) -> Result<Chain, StoreError> {
        let messages: String = col(row, "messages")?;
        let status: String = col(row, "status")?;
        let parent: Option<i64> = col(row, "parent_function_call_id")?;
        let claimed_at: Option<String> = col(row, "claimed_at")?;
        let attempts: i64 = col(row, "dispatch_attempts")?;
        let retry_after: Option<String> = col(row, "retry_after")?;
        let created_at: String = col(row, "created_at")?;

        Ok(Chain {
            id: ChainId(col(row, "id")?),
            messages: decode_json("chain messages", &messages)?,
            agent_id: AgentId(col(row, "agent_id")?),
            status: ChainStatus::from_str(&status).map_err(|e| StoreError::Decode {
                what: "chain status".into(),
                reason: e.to_string(),
            })?,
            parent_function_call_id: parent.map(FunctionCallId),
            created_at: parse_ts(&created_at)?,
            claimed_at: claimed_at.as_deref().map(parse_ts).transpose()?,
            dispatch_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            retry_after: retry_after.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn row_to_function_call(row: &SqliteRow) -> Result<FunctionCall, StoreError> {
        let result: Option<String> = col(row, "result")?;
        let added: Option<String> = col(row, "added_to_chain_at")?;
        let child: Option<i64> = col(row, "child_chain_id")?;
        let created_at: String = col(row, "created_at")?;

        Ok(FunctionCall {
            id: FunctionCallId(col(row, "id")?),
            chain_id: ChainId(col(row, "chain_id")?),
            external_id: col(row, "external_function_call_id")?,
            function_name: col(row, "function_name")?,
            arguments: col(row, "function_args")?,
            result: result
                .as_deref()
                .map(|r| decode_json("function call result", r))
                .transpose()?,
            added_to_chain_at: added.as_deref().map(parse_ts).transpose()?,
            child_chain_id: child.map(ChainId),
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_summary(row: &SqliteRow) -> Result<ChainSummary, StoreError> {
        let chain = Self::row_to_chain(row)?;
        let parent_chain: Option<i64> = col(row, "parent_chain_id")?;
        Ok(ChainSummary {
            id: chain.id,
            messages: chain.messages,
            status: chain.status,
            agent_id: chain.agent_id,
            agent_name: col(row, "agent_name")?,
            parent_function_call_id: chain.parent_function_call_id,
            parent_external_function_call_id: col(row, "parent_external_id")?,
            parent_chain_id: parent_chain.map(ChainId),
            created_at: chain.created_at,
        })
    }

    async fn fetch_chains(&self, sql: &str, context: &'static str) -> Result<Vec<Chain>, StoreError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed(context))?;
        rows.iter().map(Self::row_to_chain).collect()
    }
}

async fn insert_chain_on(conn: &mut SqliteConnection, chain: &NewChain) -> Result<Chain, StoreError> {
    let messages = encode_json("chain messages", &chain.messages)?;
    let row = sqlx::query(
        r#"
        INSERT INTO chains (messages, agent_id, status, parent_function_call_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING *
        "#,
    )
    .bind(&messages)
    .bind(chain.agent_id.get())
    .bind(ChainStatus::AwaitingLlmProcessing.as_str())
    .bind(chain.parent_function_call_id.map(FunctionCallId::get))
    .bind(ts(Utc::now()))
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| StoreError::Storage(format!("INSERT chain failed: {e}")))?;

    SqliteStore::row_to_chain(&row)
}

async fn insert_call_on(
    conn: &mut SqliteConnection,
    chain_id: ChainId,
    call: &MessageToolCall,
) -> Result<Option<FunctionCall>, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO function_calls (chain_id, external_function_call_id, function_name, function_args, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (chain_id, external_function_call_id) DO UPDATE SET
            function_name = excluded.function_name,
            function_args = excluded.function_args,
            result = ?6,
            added_to_chain_at = NULL
        WHERE function_calls.added_to_chain_at IS NOT NULL
        RETURNING *
        "#,
    )
    .bind(chain_id.get())
    .bind(&call.id)
    .bind(&call.name)
    .bind(&call.arguments)
    .bind(ts(Utc::now()))
    .bind(encode_json("duplicate call result", &duplicate_call_result(&call.id))?)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StoreError::Storage(format!("INSERT function call failed: {e}")))?;

    let call = row.as_ref().map(SqliteStore::row_to_function_call).transpose()?;
    if let Some(fc) = call.as_ref().filter(|fc| fc.result.is_some()) {
        warn!(chain_id = %chain_id, external_id = %fc.external_id, "Tool call id reused");
    }
    Ok(call)
}

const CHAIN_ORDER: &str = "ORDER BY created_at, id";

#[async_trait]
impl ChainStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert_agent(&self, agent: &AgentDefinition) -> Result<AgentRecord, StoreError> {
        let tools = encode_json("agent tools", &agent.tools)?;
        let row = sqlx::query(
            r#"
            INSERT INTO agents (name, system_prompt, tools, delegation_tool_name, delegation_tool_description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
                system_prompt = excluded.system_prompt,
                tools = excluded.tools,
                delegation_tool_name = excluded.delegation_tool_name,
                delegation_tool_description = excluded.delegation_tool_description
            RETURNING *
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.system_prompt)
        .bind(&tools)
        .bind(agent.delegation_tool_name())
        .bind(agent.delegation_tool_description())
        .bind(ts(Utc::now()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT agent failed: {e}")))?;

        debug!(agent = %agent.name, "Registered agent");
        Self::row_to_agent(&row)
    }

    async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("agent by name"))?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn get_agent_by_id(&self, id: AgentId) -> Result<Option<AgentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("agent by id"))?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("list agents"))?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn insert_chain(&self, chain: NewChain) -> Result<Chain, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Storage(format!("acquire connection: {e}")))?;
        insert_chain_on(&mut conn, &chain).await
    }

    async fn get_chain(&self, id: ChainId) -> Result<Option<Chain>, StoreError> {
        let row = sqlx::query("SELECT * FROM chains WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("chain by id"))?;
        row.as_ref().map(Self::row_to_chain).transpose()
    }

    async fn update_chain_status(&self, id: ChainId, status: ChainStatus) -> Result<bool, StoreError> {
        let claimed_at = (status == ChainStatus::LlmProcessing).then(|| ts(Utc::now()));
        let result = sqlx::query("UPDATE chains SET status = ?2, claimed_at = ?3 WHERE id = ?1")
            .bind(id.get())
            .bind(status.as_str())
            .bind(claimed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE status failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_chains(&self) -> Result<Vec<ChainSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.*,
                   a.name                      AS agent_name,
                   f.external_function_call_id AS parent_external_id,
                   f.chain_id                  AS parent_chain_id
            FROM chains c
            JOIN agents a ON a.id = c.agent_id
            LEFT JOIN function_calls f ON f.id = c.parent_function_call_id
            ORDER BY c.created_at, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("list chains"))?;
        rows.iter().map(Self::row_to_summary).collect()
    }

    async fn dispatchable_chains(&self, now: DateTime<Utc>) -> Result<Vec<Chain>, StoreError> {
        let sql = format!(
            "SELECT * FROM chains WHERE status = 'awaiting_llm_processing' \
             AND (retry_after IS NULL OR retry_after <= ?1) {CHAIN_ORDER}"
        );
        let rows = sqlx::query(&sql)
            .bind(ts(now))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("dispatchable chains"))?;
        rows.iter().map(Self::row_to_chain).collect()
    }

    async fn claim_chain(&self, id: ChainId, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE chains
            SET status = 'llm_processing', claimed_at = ?2, claim_epoch = claim_epoch + 1
            WHERE id = ?1 AND status = 'awaiting_llm_processing'
            RETURNING claim_epoch
            "#,
        )
        .bind(id.get())
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("claim chain"))?;

        match row {
            Some(r) => Ok(Some(Lease {
                chain_id: id,
                epoch: col(&r, "claim_epoch")?,
            })),
            None => Ok(None),
        }
    }

    async fn record_completion(&self, lease: Lease, message: Message) -> Result<bool, StoreError> {
        let encoded = encode_json("assistant message", &message)?;
        let next = status_after(&message);

        let mut tx = self.pool.begin().await.map_err(tx_failed("begin completion"))?;

        let updated = sqlx::query(
            r#"
            UPDATE chains
            SET messages = json_insert(messages, '$[#]', json(?3)),
                status = ?4,
                claimed_at = NULL,
                dispatch_attempts = 0,
                retry_after = NULL
            WHERE id = ?1 AND status = 'llm_processing' AND claim_epoch = ?2
            "#,
        )
        .bind(lease.chain_id.get())
        .bind(lease.epoch)
        .bind(&encoded)
        .bind(next.as_str())
        .execute(&mut *tx)
        .await
        .map_err(tx_failed("append reply"))?;

        if updated.rows_affected() == 0 {
            // Lease lost; dropping the transaction rolls it back.
            return Ok(false);
        }

        for call in message.tool_calls() {
            insert_call_on(&mut tx, lease.chain_id, call).await?;
        }

        tx.commit().await.map_err(tx_failed("commit completion"))?;
        Ok(true)
    }

    async fn record_dispatch_failure(
        &self,
        lease: Lease,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE chains
            SET status = 'awaiting_llm_processing',
                claimed_at = NULL,
                dispatch_attempts = dispatch_attempts + 1,
                retry_after = ?3
            WHERE id = ?1 AND status = 'llm_processing' AND claim_epoch = ?2
            "#,
        )
        .bind(lease.chain_id.get())
        .bind(lease.epoch)
        .bind(ts(retry_after))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("record dispatch failure: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChainId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE chains
            SET status = 'awaiting_llm_processing', claimed_at = NULL
            WHERE status = 'llm_processing' AND (claimed_at IS NULL OR claimed_at < ?1)
            RETURNING id
            "#,
        )
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("release stale claims"))?;

        rows.iter().map(|r| col(r, "id").map(ChainId)).collect()
    }

    async fn chains_awaiting_function_call(&self) -> Result<Vec<Chain>, StoreError> {
        let sql = format!("SELECT * FROM chains WHERE status = 'awaiting_function_call' {CHAIN_ORDER}");
        self.fetch_chains(&sql, "chains awaiting function call").await
    }

    async fn insert_function_call(
        &self,
        chain_id: ChainId,
        call: &MessageToolCall,
    ) -> Result<Option<FunctionCall>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Storage(format!("acquire connection: {e}")))?;
        insert_call_on(&mut conn, chain_id, call).await
    }

    async fn get_function_call(&self, id: FunctionCallId) -> Result<Option<FunctionCall>, StoreError> {
        let row = sqlx::query("SELECT * FROM function_calls WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("function call by id"))?;
        row.as_ref().map(Self::row_to_function_call).transpose()
    }

    async fn function_calls_for_chain(&self, chain_id: ChainId) -> Result<Vec<FunctionCall>, StoreError> {
        let rows = sqlx::query("SELECT * FROM function_calls WHERE chain_id = ?1 ORDER BY created_at, id")
            .bind(chain_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("function calls for chain"))?;
        rows.iter().map(Self::row_to_function_call).collect()
    }

    async fn unclaimed_function_calls(&self) -> Result<Vec<FunctionCall>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM function_calls WHERE result IS NULL AND child_chain_id IS NULL ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("unclaimed function calls"))?;
        rows.iter().map(Self::row_to_function_call).collect()
    }

    async fn set_function_call_result(
        &self,
        id: FunctionCallId,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let encoded = encode_json("function call result", result)?;
        let updated = sqlx::query("UPDATE function_calls SET result = ?2 WHERE id = ?1 AND result IS NULL")
            .bind(id.get())
            .bind(&encoded)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE result failed: {e}")))?;
        Ok(updated.rows_affected() > 0)
    }

    async fn attach_child_chain(
        &self,
        id: FunctionCallId,
        child: NewChain,
    ) -> Result<Option<Chain>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(tx_failed("begin delegation"))?;

        let chain = insert_chain_on(&mut tx, &child).await?;

        let updated = sqlx::query(
            r#"
            UPDATE function_calls SET child_chain_id = ?2
            WHERE id = ?1 AND result IS NULL AND child_chain_id IS NULL
            "#,
        )
        .bind(id.get())
        .bind(chain.id.get())
        .execute(&mut *tx)
        .await
        .map_err(tx_failed("link child chain"))?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        tx.commit().await.map_err(tx_failed("commit delegation"))?;
        Ok(Some(chain))
    }

    async fn chains_ready_for_fold(&self) -> Result<Vec<ChainId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id FROM chains c
            WHERE c.status = 'awaiting_function_call'
              AND EXISTS (
                  SELECT 1 FROM function_calls f
                  WHERE f.chain_id = c.id AND f.added_to_chain_at IS NULL
              )
              AND NOT EXISTS (
                  SELECT 1 FROM function_calls f
                  WHERE f.chain_id = c.id AND f.added_to_chain_at IS NULL AND f.result IS NULL
              )
            ORDER BY c.created_at, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("chains ready for fold"))?;

        rows.iter().map(|r| col(r, "id").map(ChainId)).collect()
    }

    async fn fold_results(&self, chain_id: ChainId) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(tx_failed("begin fold"))?;

        // No-op write: takes the write lock and re-checks the status.
        let locked = sqlx::query(
            "UPDATE chains SET status = status WHERE id = ?1 AND status = 'awaiting_function_call'",
        )
        .bind(chain_id.get())
        .execute(&mut *tx)
        .await
        .map_err(tx_failed("lock chain for fold"))?;
        if locked.rows_affected() == 0 {
            return Ok(0);
        }

        let row = sqlx::query("SELECT messages FROM chains WHERE id = ?1")
            .bind(chain_id.get())
            .fetch_one(&mut *tx)
            .await
            .map_err(tx_failed("read chain messages"))?;
        let raw: String = col(&row, "messages")?;
        let mut messages: Vec<Message> = decode_json("chain messages", &raw)?;

        let rows = sqlx::query(
            "SELECT * FROM function_calls WHERE chain_id = ?1 AND added_to_chain_at IS NULL ORDER BY id",
        )
        .bind(chain_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(tx_failed("read pending calls"))?;
        let calls = rows
            .iter()
            .map(Self::row_to_function_call)
            .collect::<Result<Vec<_>, _>>()?;

        if calls.is_empty() || calls.iter().any(|c| c.result.is_none()) {
            return Ok(0);
        }

        let calls = order_by_invocation(calls, &messages);
        messages.extend(calls.iter().filter_map(FunctionCall::to_tool_message));
        let encoded = encode_json("chain messages", &messages)?;
        let now = ts(Utc::now());

        for call in &calls {
            sqlx::query("UPDATE function_calls SET added_to_chain_at = ?2 WHERE id = ?1")
                .bind(call.id.get())
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(tx_failed("stamp folded call"))?;
        }

        sqlx::query(
            "UPDATE chains SET messages = ?2, status = 'awaiting_llm_processing' WHERE id = ?1",
        )
        .bind(chain_id.get())
        .bind(&encoded)
        .execute(&mut *tx)
        .await
        .map_err(tx_failed("append tool messages"))?;

        tx.commit().await.map_err(tx_failed("commit fold"))?;
        Ok(calls.len())
    }

    async fn completed_children_awaiting_bubble(&self) -> Result<Vec<Chain>, StoreError> {
        self.fetch_chains(
            r#"
            SELECT c.* FROM chains c
            JOIN function_calls f ON f.id = c.parent_function_call_id
            WHERE c.status = 'stop_awaiting_user' AND f.result IS NULL
            ORDER BY c.created_at, c.id
            "#,
            "completed children",
        )
        .await
    }
}

// --- Row & codec helpers ---

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode {
            what: "timestamp".into(),
            reason: format!("{s}: {e}"),
        })
}

fn encode_json<T: serde::Serialize + ?Sized>(what: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Storage(format!("encode {what}: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        what: what.into(),
        reason: e.to_string(),
    })
}

fn query_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

fn tx_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::TransactionFailed(format!("{context}: {e}"))
}
