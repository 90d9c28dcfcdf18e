// crates/engram-server/src/db/types.rs
// Row structs for persisted entities (storage forms, not wire DTOs)

/// A conversation row. `content` stays out of this table; entries carry it.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub group_id: String,
    pub title: Option<String>,
    pub owner_user_id: String,
    pub forked_from_conversation_id: Option<String>,
    pub forked_at_entry_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

/// An entry row. `content` is the encrypted serialization of the content
/// block sequence (an MSEH envelope or legacy plaintext JSON).
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub id: String,
    pub conversation_id: String,
    pub group_id: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub channel: String,
    pub memory_epoch: Option<i64>,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub group_id: String,
    pub user_id: String,
    pub access_level: i64,
}

#[derive(Debug, Clone)]
pub struct TransferRow {
    pub id: String,
    pub conversation_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub id: String,
    pub user_id: String,
    pub storage_key: String,
    pub filename: Option<String>,
    pub content_type: String,
    pub size: i64,
    pub sha256: Option<String>,
    pub entry_id: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub deleted_at: Option<String>,
}

/// An episodic memory row. Value and user attributes are ciphertext;
/// `policy_attributes` is the plaintext JSON the policy bundle extracted
/// at write time for filter evaluation.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub id: String,
    pub encoded_namespace: String,
    pub key: String,
    pub value_ciphertext: Vec<u8>,
    pub attributes_ciphertext: Option<Vec<u8>>,
    pub policy_attributes: Option<String>,
    pub index_fields: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
    pub deleted_at: Option<String>,
    pub last_indexed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryEventRow {
    pub id: String,
    pub encoded_namespace: String,
    pub key: String,
    pub kind: String,
    pub occurred_at: String,
    pub value_snapshot: Option<Vec<u8>>,
    pub attributes_snapshot: Option<Vec<u8>>,
}

/// A background job. `retry_at` is when the job next becomes claimable;
/// claiming pushes it forward so a crashed worker's claim expires.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_type: String,
    pub task_body: String,
    pub retry_at: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DekRow {
    pub provider_id: String,
    pub created_at: String,
    pub wrapped_dek: Vec<u8>,
}
