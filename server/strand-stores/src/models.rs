use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::{agent_runs, messages, threads};

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = threads, primary_key(thread_id))]
pub struct ThreadModel {
    pub thread_id: String,
    pub project_id: Option<String>,
    pub account_id: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = threads)]
pub struct NewThreadModel<'a> {
    pub thread_id: &'a str,
    pub project_id: Option<&'a str>,
    pub account_id: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Associations)]
#[diesel(table_name = messages)]
#[diesel(belongs_to(ThreadModel, foreign_key = thread_id))]
pub struct MessageModel {
    pub id: i64,
    pub message_id: String,
    pub thread_id: String,
    pub message_type: String,
    pub is_llm_message: bool,
    pub content: String,
    pub metadata: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessageModel<'a> {
    pub message_id: &'a str,
    pub thread_id: &'a str,
    pub message_type: &'a str,
    pub is_llm_message: bool,
    pub content: &'a str,
    pub metadata: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Associations)]
#[diesel(table_name = agent_runs)]
#[diesel(belongs_to(ThreadModel, foreign_key = thread_id))]
pub struct AgentRunModel {
    pub id: String,
    pub thread_id: String,
    pub status: String,
    pub error: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub model_name: String,
    pub user_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = agent_runs)]
pub struct NewAgentRunModel<'a> {
    pub id: &'a str,
    pub thread_id: &'a str,
    pub status: &'a str,
    pub error: Option<&'a str>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub model_name: &'a str,
    pub user_id: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
