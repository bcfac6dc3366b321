//! Storage backends for the agent runtime: message/thread/run persistence
//! and the pub/sub + lease layer, each behind the traits in `strand-types`.

pub mod initialize;
pub mod memory;
pub mod pubsub;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod diesel_store;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod models;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;

pub use initialize::{initialize_stores, InitializedStores};
pub use memory::{InMemoryAccountDirectory, InMemoryMessageStore};
pub use pubsub::memory::InMemoryPubSub;

#[cfg(feature = "redis")]
pub use pubsub::redis::RedisPubSub;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub use diesel_store::DieselMessageStore;

use strand_types::{AccountDirectory, AgentError, Message, MessageType, DEMO_ACCOUNT_ID};
use uuid::Uuid;

/// Applies the summary-window rule shared by every backend: when a summary
/// message exists, the LLM view is the most recent summary followed only by
/// messages created strictly after it.
pub(crate) fn trim_to_latest_summary(messages: Vec<Message>) -> Vec<Message> {
    match messages
        .iter()
        .rposition(|m| m.message_type == MessageType::Summary)
    {
        Some(index) => messages[index..].to_vec(),
        None => messages,
    }
}

/// Referential check shared by every backend; the demo sentinel bypasses it.
pub(crate) async fn ensure_owner_exists(
    directory: &dyn AccountDirectory,
    account_id: &str,
    project_id: Option<Uuid>,
) -> Result<(), AgentError> {
    if account_id == DEMO_ACCOUNT_ID {
        return Ok(());
    }
    if !directory.account_exists(account_id).await? {
        return Err(AgentError::NotFound(format!(
            "account {account_id} does not exist"
        )));
    }
    if let Some(project_id) = project_id {
        if !directory.project_exists(project_id).await? {
            return Err(AgentError::NotFound(format!(
                "project {project_id} does not exist"
            )));
        }
    }
    Ok(())
}
