// crates/engram-server/src/convo/mod.rs
// Conversation core: the public contract over the store and its satellites

mod attachments;
mod service;
mod stream;

pub use attachments::{AttachmentService, AttachmentSink, FsAttachmentSink};
pub use service::{ConversationService, TASK_DELETE_GROUP_INDEX, TASK_INDEX_ENTRY};
pub use stream::{StreamOutcome, pump};
