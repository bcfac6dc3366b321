use std::sync::Arc;

use strand_types::{
    AccountDirectory, AgentError, MessageStore, PubSub, RuntimeConfig, StoreBackendKind,
    StoreConfig,
};

use crate::memory::InMemoryMessageStore;
use crate::pubsub::memory::InMemoryPubSub;

/// The storage layer a process runs against, assembled once at startup.
pub struct InitializedStores {
    pub message_store: Arc<dyn MessageStore>,
    pub pubsub: Arc<dyn PubSub>,
}

/// Initializes message store and pub/sub backends from configuration.
pub async fn initialize_stores(
    config: &StoreConfig,
    runtime: &RuntimeConfig,
    directory: Arc<dyn AccountDirectory>,
) -> Result<InitializedStores, AgentError> {
    let message_store: Arc<dyn MessageStore> = match config.backend {
        StoreBackendKind::Memory => Arc::new(InMemoryMessageStore::new(directory)),
        #[cfg(any(feature = "sqlite", feature = "postgres"))]
        StoreBackendKind::Sqlite | StoreBackendKind::Postgres => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                AgentError::InvalidConfiguration(
                    "DATABASE_URL is required for the sql store backend".to_string(),
                )
            })?;
            Arc::new(
                crate::diesel_store::DieselMessageStore::connect(database_url, 10, directory)
                    .await?,
            )
        }
        #[cfg(not(any(feature = "sqlite", feature = "postgres")))]
        StoreBackendKind::Sqlite | StoreBackendKind::Postgres => {
            return Err(AgentError::InvalidConfiguration(
                "sql store backend requires the sqlite or postgres feature".to_string(),
            ));
        }
    };

    let pubsub: Arc<dyn PubSub> = match &config.redis {
        #[cfg(feature = "redis")]
        Some(redis) => Arc::new(
            crate::pubsub::redis::RedisPubSub::connect(
                &redis.url,
                redis.prefix.clone(),
                runtime.redis_response_list_ttl,
            )
            .await?,
        ),
        #[cfg(not(feature = "redis"))]
        Some(redis) => {
            tracing::warn!(
                url = %redis.url,
                "redis configured but the redis feature is disabled; using in-memory pubsub"
            );
            Arc::new(InMemoryPubSub::new(runtime.redis_response_list_ttl))
        }
        None => Arc::new(InMemoryPubSub::new(runtime.redis_response_list_ttl)),
    };

    Ok(InitializedStores {
        message_store,
        pubsub,
    })
}
