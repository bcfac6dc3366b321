#![allow(clippy::all)]

diesel::table! {
    threads (thread_id) {
        thread_id -> Text,
        project_id -> Nullable<Text>,
        account_id -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    messages (id) {
        id -> BigInt,
        message_id -> Text,
        thread_id -> Text,
        message_type -> Text,
        is_llm_message -> Bool,
        content -> Text,
        metadata -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    agent_runs (id) {
        id -> Text,
        thread_id -> Text,
        status -> Text,
        error -> Nullable<Text>,
        started_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        model_name -> Text,
        user_id -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::joinable!(messages -> threads (thread_id));
diesel::joinable!(agent_runs -> threads (thread_id));

diesel::allow_tables_to_appear_in_same_query!(threads, messages, agent_runs);
