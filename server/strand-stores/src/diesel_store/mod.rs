use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncMigrationHarness;
use diesel_async::RunQueryDsl;
#[cfg(feature = "sqlite")]
use diesel_async::SimpleAsyncConnection;
#[cfg(feature = "sqlite")]
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use strand_types::{
    AccountDirectory, AgentError, AgentRun, Message, MessageStore, MessageType, NewAgentRun,
    NewMessage, RunStatus, Thread,
};
use uuid::Uuid;

use crate::models::{
    AgentRunModel, MessageModel, NewAgentRunModel, NewMessageModel, NewThreadModel, ThreadModel,
};
use crate::schema::{agent_runs, messages, threads};

pub const EMBEDDED_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[cfg(feature = "sqlite")]
pub type StoreConnection = SyncConnectionWrapper<diesel::sqlite::SqliteConnection>;
#[cfg(all(not(feature = "sqlite"), feature = "postgres"))]
pub type StoreConnection = diesel_async::AsyncPgConnection;

pub type StoreManager = AsyncDieselConnectionManager<StoreConnection>;
pub type StorePool = Pool<StoreConnection>;

const MAX_DB_ATTEMPTS: u32 = 3;

/// Durable message store on the relational schema in `migrations/`. Transient
/// database errors are retried with backoff inside the store; everything else
/// surfaces as-is.
#[derive(Clone)]
pub struct DieselMessageStore {
    pool: StorePool,
    directory: Arc<dyn AccountDirectory>,
}

impl DieselMessageStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        directory: Arc<dyn AccountDirectory>,
    ) -> Result<Self, AgentError> {
        let manager = StoreManager::new(database_url);
        let pool = StorePool::builder(manager)
            .max_size(max_connections as usize)
            .build()
            .map_err(|e| AgentError::InvalidConfiguration(format!("failed to build pool: {e}")))?;

        let conn = pool.get().await.map_err(pool_err)?;

        #[cfg(feature = "sqlite")]
        let conn = {
            let mut conn = conn;
            conn.batch_execute("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
                .await
                .map_err(db_err)?;
            conn
        };

        // Migrations run on a pooled connection so in-memory sqlite databases
        // with shared cache stay initialized for the pool's lifetime.
        let mut harness = AsyncMigrationHarness::new(conn);
        tokio::task::spawn_blocking(move || {
            diesel_migrations::MigrationHarness::run_pending_migrations(
                &mut harness,
                EMBEDDED_MIGRATIONS,
            )
            .map(|_| ())
            .map_err(|e| AgentError::Storage(format!("failed to run migrations: {e}")))
        })
        .await
        .map_err(|e| AgentError::Storage(format!("migration thread panicked: {e}")))??;

        Ok(Self { pool, directory })
    }

    async fn get_thread_model(&self, thread_id: Uuid) -> Result<ThreadModel, AgentError> {
        let thread_id_s = thread_id.to_string();
        with_retry(|| {
            let pool = self.pool.clone();
            let thread_id_s = thread_id_s.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                threads::table
                    .filter(threads::thread_id.eq(&thread_id_s))
                    .first::<ThreadModel>(&mut conn)
                    .await
                    .optional()
                    .map_err(db_err)?
                    .ok_or_else(|| {
                        AgentError::NotFound(format!("thread {thread_id_s} does not exist"))
                    })
            }
        })
        .await
    }

    async fn load_messages(
        &self,
        thread_id: Uuid,
        llm_only: bool,
    ) -> Result<Vec<Message>, AgentError> {
        // Existence check first so an empty thread and a missing thread stay
        // distinguishable.
        self.get_thread_model(thread_id).await?;
        let thread_id_s = thread_id.to_string();
        let models = with_retry(|| {
            let pool = self.pool.clone();
            let thread_id_s = thread_id_s.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                let mut query = messages::table
                    .filter(messages::thread_id.eq(&thread_id_s))
                    .into_boxed();
                if llm_only {
                    query = query.filter(messages::is_llm_message.eq(true));
                }
                query
                    .order((messages::created_at.asc(), messages::id.asc()))
                    .load::<MessageModel>(&mut conn)
                    .await
                    .map_err(db_err)
            }
        })
        .await?;
        models.into_iter().map(to_message).collect()
    }
}

#[async_trait::async_trait]
impl MessageStore for DieselMessageStore {
    async fn create_thread(
        &self,
        project_id: Option<Uuid>,
        account_id: &str,
    ) -> Result<Thread, AgentError> {
        crate::ensure_owner_exists(self.directory.as_ref(), account_id, project_id).await?;

        let thread = Thread {
            thread_id: Uuid::new_v4(),
            project_id,
            account_id: account_id.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let thread_id_s = thread.thread_id.to_string();
        let project_id_s = project_id.map(|p| p.to_string());

        with_retry(|| {
            let pool = self.pool.clone();
            let row = NewThreadModel {
                thread_id: &thread_id_s,
                project_id: project_id_s.as_deref(),
                account_id,
                created_at: to_naive(thread.created_at),
                updated_at: to_naive(thread.updated_at),
            };
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                diesel::insert_into(threads::table)
                    .values(&row)
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
                Ok(())
            }
        })
        .await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Thread, AgentError> {
        to_thread(self.get_thread_model(thread_id).await?)
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), AgentError> {
        let thread_id_s = thread_id.to_string();
        with_retry(|| {
            let pool = self.pool.clone();
            let thread_id_s = thread_id_s.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                diesel::delete(messages::table.filter(messages::thread_id.eq(&thread_id_s)))
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
                let deleted =
                    diesel::delete(threads::table.filter(threads::thread_id.eq(&thread_id_s)))
                        .execute(&mut conn)
                        .await
                        .map_err(db_err)?;
                if deleted == 0 {
                    return Err(AgentError::NotFound(format!(
                        "thread {thread_id_s} does not exist"
                    )));
                }
                Ok(())
            }
        })
        .await
    }

    async fn append_message(
        &self,
        thread_id: Uuid,
        message: NewMessage,
    ) -> Result<Message, AgentError> {
        self.get_thread_model(thread_id).await?;

        let persisted = Message {
            message_id: Uuid::new_v4(),
            thread_id,
            message_type: message.message_type,
            content: message.content,
            is_llm_message: message.is_llm_message,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        let message_id_s = persisted.message_id.to_string();
        let thread_id_s = thread_id.to_string();
        let content_json = serde_json::to_string(&persisted.content)?;
        let metadata_json = serde_json::to_string(&persisted.metadata)?;

        with_retry(|| {
            let pool = self.pool.clone();
            let row = NewMessageModel {
                message_id: &message_id_s,
                thread_id: &thread_id_s,
                message_type: persisted.message_type.as_str(),
                is_llm_message: persisted.is_llm_message,
                content: &content_json,
                metadata: &metadata_json,
                created_at: to_naive(persisted.created_at),
            };
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                diesel::insert_into(messages::table)
                    .values(&row)
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
                diesel::update(threads::table.filter(threads::thread_id.eq(row.thread_id)))
                    .set(threads::updated_at.eq(row.created_at))
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
                Ok(())
            }
        })
        .await?;
        Ok(persisted)
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError> {
        self.load_messages(thread_id, false).await
    }

    async fn list_llm_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError> {
        let messages = self.load_messages(thread_id, true).await?;
        Ok(crate::trim_to_latest_summary(messages))
    }

    async fn delete_messages_by_type(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
    ) -> Result<usize, AgentError> {
        self.get_thread_model(thread_id).await?;
        let thread_id_s = thread_id.to_string();
        with_retry(|| {
            let pool = self.pool.clone();
            let thread_id_s = thread_id_s.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                diesel::delete(
                    messages::table.filter(
                        messages::thread_id
                            .eq(&thread_id_s)
                            .and(messages::message_type.eq(message_type.as_str())),
                    ),
                )
                .execute(&mut conn)
                .await
                .map_err(db_err)
            }
        })
        .await
    }

    async fn create_run(&self, run: NewAgentRun) -> Result<AgentRun, AgentError> {
        self.get_thread_model(run.thread_id).await?;

        let now = Utc::now();
        let agent_run = AgentRun {
            id: run.id,
            thread_id: run.thread_id,
            status: RunStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
            model_name: run.model_name,
            user_id: run.user_id,
            created_at: now,
            updated_at: now,
        };
        let id_s = agent_run.id.to_string();
        let thread_id_s = agent_run.thread_id.to_string();
        let user_id_s = agent_run.user_id.map(|u| u.to_string());

        with_retry(|| {
            let pool = self.pool.clone();
            let row = NewAgentRunModel {
                id: &id_s,
                thread_id: &thread_id_s,
                status: RunStatus::Pending.as_str(),
                error: None,
                started_at: None,
                completed_at: None,
                model_name: &agent_run.model_name,
                user_id: user_id_s.as_deref(),
                created_at: to_naive(now),
                updated_at: to_naive(now),
            };
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                diesel::insert_into(agent_runs::table)
                    .values(&row)
                    .execute(&mut conn)
                    .await
                    .map_err(db_err)?;
                Ok(())
            }
        })
        .await?;
        Ok(agent_run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<AgentRun, AgentError> {
        let id_s = run_id.to_string();
        let model = with_retry(|| {
            let pool = self.pool.clone();
            let id_s = id_s.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                agent_runs::table
                    .filter(agent_runs::id.eq(&id_s))
                    .first::<AgentRunModel>(&mut conn)
                    .await
                    .optional()
                    .map_err(db_err)?
                    .ok_or_else(|| AgentError::NotFound(format!("run {id_s} does not exist")))
            }
        })
        .await?;
        to_run(model)
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), AgentError> {
        let allowed_prior: Vec<&'static str> = match status {
            RunStatus::Pending => Vec::new(),
            RunStatus::Running => vec![RunStatus::Pending.as_str()],
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed => {
                vec![RunStatus::Pending.as_str(), RunStatus::Running.as_str()]
            }
        };
        if allowed_prior.is_empty() {
            return Err(AgentError::Conflict(format!(
                "run {run_id} cannot move back to {status}"
            )));
        }

        let id_s = run_id.to_string();
        let now = to_naive(Utc::now());
        let completed_naive = completed_at.map(to_naive);
        let updated = with_retry(|| {
            let pool = self.pool.clone();
            let id_s = id_s.clone();
            let allowed = allowed_prior.clone();
            let error = error.clone();
            async move {
                let mut conn = pool.get().await.map_err(pool_err)?;
                let target = agent_runs::table.filter(
                    agent_runs::id
                        .eq(&id_s)
                        .and(agent_runs::status.eq_any(allowed)),
                );
                let rows = if status == RunStatus::Running {
                    diesel::update(target)
                        .set((
                            agent_runs::status.eq(status.as_str()),
                            agent_runs::started_at.eq(Some(now)),
                            agent_runs::updated_at.eq(now),
                        ))
                        .execute(&mut conn)
                        .await
                        .map_err(db_err)?
                } else {
                    diesel::update(target)
                        .set((
                            agent_runs::status.eq(status.as_str()),
                            agent_runs::error.eq(error.as_deref()),
                            agent_runs::completed_at.eq(completed_naive),
                            agent_runs::updated_at.eq(now),
                        ))
                        .execute(&mut conn)
                        .await
                        .map_err(db_err)?
                };
                Ok(rows)
            }
        })
        .await?;

        if updated == 0 {
            // Distinguish a missing run from a non-monotonic transition.
            let current = self.get_run(run_id).await?;
            return Err(AgentError::Conflict(format!(
                "run {run_id} cannot move from {} to {status}",
                current.status
            )));
        }
        Ok(())
    }
}

async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentError>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < MAX_DB_ATTEMPTS => {
                attempt += 1;
                tracing::warn!("transient store error (attempt {attempt}): {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}

fn db_err(err: DieselError) -> AgentError {
    match &err {
        DieselError::DatabaseError(kind, info) => {
            let message = info.message().to_ascii_lowercase();
            let busy = message.contains("locked") || message.contains("busy");
            match kind {
                DatabaseErrorKind::ClosedConnection => AgentError::Transient(err.to_string()),
                DatabaseErrorKind::SerializationFailure => AgentError::Transient(err.to_string()),
                _ if busy => AgentError::Transient(err.to_string()),
                _ => AgentError::Storage(err.to_string()),
            }
        }
        DieselError::NotFound => AgentError::NotFound("row not found".to_string()),
        _ => AgentError::Storage(err.to_string()),
    }
}

fn pool_err<E: std::fmt::Display>(err: E) -> AgentError {
    AgentError::Transient(format!("db pool: {err}"))
}

fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&dt)
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, AgentError> {
    Uuid::parse_str(raw).map_err(|e| AgentError::Storage(format!("corrupt {what} id {raw}: {e}")))
}

fn to_thread(model: ThreadModel) -> Result<Thread, AgentError> {
    Ok(Thread {
        thread_id: parse_uuid(&model.thread_id, "thread")?,
        project_id: model
            .project_id
            .as_deref()
            .map(|p| parse_uuid(p, "project"))
            .transpose()?,
        account_id: model.account_id,
        created_at: from_naive(model.created_at),
        updated_at: from_naive(model.updated_at),
    })
}

fn to_message(model: MessageModel) -> Result<Message, AgentError> {
    Ok(Message {
        message_id: parse_uuid(&model.message_id, "message")?,
        thread_id: parse_uuid(&model.thread_id, "thread")?,
        message_type: model.message_type.parse()?,
        content: serde_json::from_str(&model.content)?,
        is_llm_message: model.is_llm_message,
        metadata: serde_json::from_str(&model.metadata).unwrap_or_default(),
        created_at: from_naive(model.created_at),
    })
}

fn to_run(model: AgentRunModel) -> Result<AgentRun, AgentError> {
    Ok(AgentRun {
        id: parse_uuid(&model.id, "run")?,
        thread_id: parse_uuid(&model.thread_id, "thread")?,
        status: model.status.parse()?,
        error: model.error,
        started_at: model.started_at.map(from_naive),
        completed_at: model.completed_at.map(from_naive),
        model_name: model.model_name,
        user_id: model
            .user_id
            .as_deref()
            .map(|u| parse_uuid(u, "user"))
            .transpose()?,
        created_at: from_naive(model.created_at),
        updated_at: from_naive(model.updated_at),
    })
}
