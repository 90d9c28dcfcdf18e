// crates/engram-server/src/db/mod.rs
// Storage layer: rusqlite + sqlite-vec behind an async pool
//
// Every operation is a `_sync` free function over `&Connection`, run
// through `DatabasePool::run` (or its retrying / best-effort variants)
// so it executes on a blocking thread. The function surface is the store
// contract the rest of the system programs against.

mod attachments;
mod conversations;
mod deks;
mod entries;
mod episodic;
mod events;
mod locators;
mod memberships;
mod migration_helpers;
mod orgs;
pub mod pool;
pub mod schema;
mod tasks;
mod transfers;
pub mod types;

pub use attachments::{
    create_attachment_sync, delete_attachment_sync, expired_attachments_sync,
    finalize_attachment_sync, get_attachment_sync, link_attachment_sync, parse_attachment_row,
    refresh_attachment_ttl_sync,
};
pub use conversations::{
    VISIBLE_GROUPS_SQL, admin_list_conversations_sync, create_conversation_sync, cursor,
    delete_conversation_sync, delete_group_sync, fork_conversation_sync, get_conversation_sync,
    list_conversations_sync, list_forks_sync, parse_conversation_row, restore_conversation_sync,
    touch_conversation_sync,
};
pub use deks::{insert_dek_sync, load_deks_sync};
pub use entries::{
    EntryFilter, append_entry_sync, count_entries_sync, get_entry_by_id_sync, get_entry_sync,
    latest_epoch_sync, list_entries_sync, parse_entry_row, sync_memory_sync,
    update_entry_content_sync,
};
pub use episodic::{
    UpsertMemoryParams, delete_memory_sync, expired_memories_sync, force_delete_memories_sync,
    get_memory_by_id_sync, get_memory_sync, list_memories_by_prefix_sync, list_namespaces_sync,
    mark_memory_indexed_sync, parse_memory_row, pending_index_memories_sync,
    soft_delete_memory_by_id_sync, upsert_memory_sync,
};
pub use events::{EventFilter, append_event_sync, list_events_sync, parse_event_row};
pub use locators::{
    delete_expired_locators_sync, delete_locator_sync, get_locator_sync, put_locator_sync,
    refresh_locator_sync,
};
pub use memberships::{
    delete_membership_sync, group_owner_sync, list_memberships_sync, membership_level_sync,
    parse_membership_row, upsert_membership_sync,
};
pub use orgs::{
    add_org_member_sync, add_team_member_sync, create_organization_sync, create_team_sync,
    group_scope_sync, is_team_member_sync, org_role_sync,
};
pub use tasks::{
    MAX_RETRIES, claim_due_tasks_sync, complete_task_sync, count_pending_tasks_sync,
    enqueue_task_sync, fail_task_sync, parse_task_row,
};
pub use transfers::{
    accept_transfer_sync, cancel_transfer_sync, get_transfer_sync, list_transfers_sync,
    parse_transfer_row, request_transfer_sync,
};
