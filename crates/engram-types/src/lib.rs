// crates/engram-types/src/lib.rs

//! Shared data contracts between the Engram server and its clients.
//!
//! This crate provides the wire-level domain model:
//! - **Conversations and entries**: the transcript DAG, channels, memory epochs
//! - **Sharing**: access levels, memberships, ownership transfers
//! - **Episodic memory**: namespaced items, events, search requests
//! - **ID helpers**: canonical-string and 16-byte big-endian UUID forms
//!
//! These types carry no server-side dependencies and are usable by clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ===================================================
// ENUMS
// ===================================================

/// Entry channel within a conversation.
///
/// HISTORY is the user-visible transcript, MEMORY the agent working memory
/// (epoch-scoped per client), SUMMARY agent-written summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    History,
    Memory,
    Summary,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::History => "HISTORY",
            Channel::Memory => "MEMORY",
            Channel::Summary => "SUMMARY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HISTORY" => Some(Channel::History),
            "MEMORY" => Some(Channel::Memory),
            "SUMMARY" => Some(Channel::Summary),
            _ => None,
        }
    }
}

/// Access level on a conversation group, totally ordered by rank.
///
/// OWNER(4) > MANAGER(3) > WRITER(2) > READER(1). There is exactly one
/// OWNER per group at all times; OWNER moves only via ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Reader,
    Writer,
    Manager,
    Owner,
}

impl AccessLevel {
    /// Numeric rank used for comparisons and storage.
    pub fn rank(&self) -> i64 {
        match self {
            AccessLevel::Reader => 1,
            AccessLevel::Writer => 2,
            AccessLevel::Manager => 3,
            AccessLevel::Owner => 4,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(AccessLevel::Reader),
            2 => Some(AccessLevel::Writer),
            3 => Some(AccessLevel::Manager),
            4 => Some(AccessLevel::Owner),
            _ => None,
        }
    }

    /// Highest level the holder of `self` may grant to someone else.
    ///
    /// OWNER grants up to MANAGER (ownership itself is transferred, never
    /// assigned); MANAGER grants up to WRITER; everyone else grants nothing.
    pub fn grant_ceiling(&self) -> Option<AccessLevel> {
        match self {
            AccessLevel::Owner => Some(AccessLevel::Manager),
            AccessLevel::Manager => Some(AccessLevel::Writer),
            _ => None,
        }
    }
}

impl PartialOrd for AccessLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AccessLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Conversation listing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    Owned,
    Shared,
    #[default]
    All,
}

/// Lifecycle of an ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Accepted => "ACCEPTED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransferStatus::Pending),
            "ACCEPTED" => Some(TransferStatus::Accepted),
            "CANCELLED" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }
}

/// Role of the caller in a transfer listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferRole {
    Initiator,
    Recipient,
}

/// Organization membership role. `admin` and `owner` imply MANAGER access
/// over every group scoped to the organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Admin,
    Member,
}

impl OrgRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(OrgRole::Owner),
            "admin" => Some(OrgRole::Admin),
            "member" => Some(OrgRole::Member),
            _ => None,
        }
    }
}

/// Kind of an episodic memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryEventKind {
    Add,
    Update,
    Delete,
    Expired,
}

impl MemoryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::Add => "add",
            MemoryEventKind::Update => "update",
            MemoryEventKind::Delete => "delete",
            MemoryEventKind::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(MemoryEventKind::Add),
            "update" => Some(MemoryEventKind::Update),
            "delete" => Some(MemoryEventKind::Delete),
            "expired" => Some(MemoryEventKind::Expired),
            _ => None,
        }
    }
}

// ===================================================
// CONVERSATION DTOS
// ===================================================

/// A conversation as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDto {
    pub id: Uuid,
    /// Access-control anchor shared by the whole fork tree.
    pub group_id: Uuid,
    pub title: Option<String>,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from_conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_at_entry_id: Option<Uuid>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

/// A single entry. `content` is an ordered sequence of opaque content
/// blocks; block internals are never interpreted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDto {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub group_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_epoch: Option<i64>,
    pub content: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipDto {
    pub group_id: Uuid,
    pub user_id: String,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDto {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: TransferStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDto {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<Uuid>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

// ===================================================
// REQUESTS
// ===================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
    /// Scope the new group to an organization (optional).
    pub organization_id: Option<Uuid>,
    /// Scope the new group to a team (optional).
    pub team_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryRequest {
    pub channel: Channel,
    pub content: Vec<serde_json::Value>,
    pub content_type: Option<String>,
    pub client_id: Option<String>,
}

/// One entry of a memory snapshot pushed via sync-memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMemoryEntry {
    pub content: Vec<serde_json::Value>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMemoryRequest {
    pub client_id: String,
    pub entries: Vec<SyncMemoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntriesQuery {
    pub after: Option<Uuid>,
    pub limit: Option<usize>,
    pub channel: Option<Channel>,
    pub client_id: Option<String>,
    /// For MEMORY listings: absent means "latest epoch".
    pub epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRequest {
    pub user_id: String,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMembershipRequest {
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub conversation_id: Uuid,
    pub to_user_id: String,
}

/// Corpus search over conversations the caller can read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    /// Restrict to these conversations.
    pub conversation_ids: Option<Vec<Uuid>>,
    /// Only entries created strictly before this timestamp.
    pub before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry_id: Uuid,
    pub conversation_id: Uuid,
    /// Similarity in (0, 1] for semantic hits; absent for full-text hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Which index produced the hits ("semantic" or "fulltext").
    pub search_type: String,
}

// ===================================================
// EPISODIC MEMORY
// ===================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPutRequest {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
    /// JSON paths into `value` whose string contents feed the vector index.
    #[serde(default)]
    pub index_fields: Option<Vec<String>>,
    /// Relative TTL in seconds.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItemDto {
    pub id: Uuid,
    pub namespace: Vec<String>,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Similarity in (0, 1] when produced by a semantic search; null for
    /// attribute-filtered lookups.
    pub score: Option<f32>,
}

/// Attribute filter conditions: bare scalars mean equality, objects may
/// carry `in`, `gt`, `gte`, `lt`, `lte`. All conditions AND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchRequest {
    pub namespace_prefix: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub filter: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEventDto {
    pub id: Uuid,
    pub namespace: Vec<String>,
    pub key: String,
    pub kind: MemoryEventKind,
    pub occurred_at: String,
    /// Null on `delete` and `expired` events.
    pub value: Option<serde_json::Value>,
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEventsPage {
    pub events: Vec<MemoryEventDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ===================================================
// UUID WIRE HELPERS
// ===================================================

/// The gRPC surface carries UUIDs as 16-byte big-endian `bytes`; REST uses
/// canonical 36-character strings. These helpers convert and validate.
pub mod id {
    use uuid::Uuid;

    /// Canonical string → UUID, rejecting non-canonical forms.
    pub fn parse_canonical(s: &str) -> Result<Uuid, String> {
        if s.len() != 36 {
            return Err(format!("expected 36-character canonical UUID, got {} chars", s.len()));
        }
        Uuid::parse_str(s).map_err(|e| format!("invalid UUID: {e}"))
    }

    /// UUID → 16-byte big-endian representation.
    pub fn to_bytes(id: Uuid) -> [u8; 16] {
        *id.as_bytes()
    }

    /// 16-byte big-endian representation → UUID.
    pub fn from_bytes(bytes: &[u8]) -> Result<Uuid, String> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| format!("expected 16 bytes, got {}", bytes.len()))?;
        Ok(Uuid::from_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Owner > AccessLevel::Manager);
        assert!(AccessLevel::Manager > AccessLevel::Writer);
        assert!(AccessLevel::Writer > AccessLevel::Reader);
        assert_eq!(AccessLevel::from_rank(4), Some(AccessLevel::Owner));
        assert_eq!(AccessLevel::from_rank(0), None);
    }

    #[test]
    fn test_grant_ceiling() {
        assert_eq!(AccessLevel::Owner.grant_ceiling(), Some(AccessLevel::Manager));
        assert_eq!(AccessLevel::Manager.grant_ceiling(), Some(AccessLevel::Writer));
        assert_eq!(AccessLevel::Writer.grant_ceiling(), None);
        assert_eq!(AccessLevel::Reader.grant_ceiling(), None);
    }

    #[test]
    fn test_channel_serde() {
        let json = serde_json::to_string(&Channel::Memory).unwrap();
        assert_eq!(json, "\"MEMORY\"");
        let back: Channel = serde_json::from_str("\"HISTORY\"").unwrap();
        assert_eq!(back, Channel::History);
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            MemoryEventKind::Add,
            MemoryEventKind::Update,
            MemoryEventKind::Delete,
            MemoryEventKind::Expired,
        ] {
            assert_eq!(MemoryEventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_uuid_bytes_round_trip() {
        let original = Uuid::new_v4();
        let bytes = id::to_bytes(original);
        assert_eq!(id::from_bytes(&bytes).unwrap(), original);
    }

    #[test]
    fn test_uuid_bytes_rejects_wrong_length() {
        assert!(id::from_bytes(&[0u8; 15]).is_err());
        assert!(id::from_bytes(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_parse_canonical_rejects_braced() {
        assert!(id::parse_canonical("{2b6a30c0-6e5a-4ae2-8a8f-3f1c09e2b000}").is_err());
        assert!(id::parse_canonical("2b6a30c0-6e5a-4ae2-8a8f-3f1c09e2b000").is_ok());
    }

    #[test]
    fn test_memory_search_request_deserialize() {
        let json = r#"{"namespace_prefix":["user","alice"],"query":"whitespace-sensitive syntax"}"#;
        let req: MemorySearchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.namespace_prefix, vec!["user", "alice"]);
        assert_eq!(req.query.as_deref(), Some("whitespace-sensitive syntax"));
        assert!(req.filter.is_none());
    }
}
