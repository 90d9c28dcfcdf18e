//! End-to-end scenarios over the full service wiring: fork semantics,
//! memory epochs, sharing rules, ownership transfer, key rotation,
//! resumable streaming, and the episodic engine.

mod test_utils;

use engram::EngramError;
use engram::convo::pump;
use engram::resume::Replay;
use engram_types::{
    AccessLevel, AppendEntryRequest, Channel, CreateConversationRequest, ForkRequest,
    MemoryEventKind, MemoryPutRequest, MemorySearchRequest, ShareRequest, SyncMemoryEntry,
    SyncMemoryRequest, TransferRole,
};
use futures::StreamExt;
use test_utils::{TestContext, admin, test_chain, text_blocks, user};

fn append_history(text: &str) -> AppendEntryRequest {
    AppendEntryRequest {
        channel: Channel::History,
        content: text_blocks(text),
        content_type: Some("LC4J".to_string()),
        client_id: None,
    }
}

fn sync_request(client: &str, texts: &[&str]) -> SyncMemoryRequest {
    SyncMemoryRequest {
        client_id: client.to_string(),
        entries: texts
            .iter()
            .map(|t| SyncMemoryEntry { content: text_blocks(t), content_type: None })
            .collect(),
    }
}

// ═══════════════════════════════════════
// Fork mid-conversation
// ═══════════════════════════════════════

#[tokio::test]
async fn test_fork_mid_conversation() {
    let ctx = TestContext::new().await;
    let alice = user("alice");

    let c1 = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let c1_id = c1.id.to_string();

    let e1 = ctx.conversations.append_entry(&alice, &c1_id, append_history("hi")).await.unwrap();
    let e2 = ctx
        .conversations
        .append_entry(&alice, &c1_id, append_history("how are you"))
        .await
        .unwrap();
    let e3 = ctx.conversations.append_entry(&alice, &c1_id, append_history("fine")).await.unwrap();

    let c2 = ctx
        .conversations
        .fork(&alice, &c1_id, &e2.id.to_string(), ForkRequest { title: None })
        .await
        .unwrap();
    assert_eq!(c2.group_id, c1.group_id, "forks share the parent's group");
    let c2_id = c2.id.to_string();

    let e4 = ctx.conversations.append_entry(&alice, &c2_id, append_history("great")).await.unwrap();

    let fork_entries = ctx
        .conversations
        .list_entries(&alice, &c2_id, None, None, None, None, 100)
        .await
        .unwrap();
    let fork_ids: Vec<_> = fork_entries.iter().map(|e| e.id).collect();
    assert_eq!(fork_ids, vec![e1.id, e2.id, e4.id]);

    let parent_entries = ctx
        .conversations
        .list_entries(&alice, &c1_id, None, None, None, None, 100)
        .await
        .unwrap();
    let parent_ids: Vec<_> = parent_entries.iter().map(|e| e.id).collect();
    assert_eq!(parent_ids, vec![e1.id, e2.id, e3.id]);

    // Repeated reads are stable
    let again = ctx
        .conversations
        .list_entries(&alice, &c2_id, None, None, None, None, 100)
        .await
        .unwrap();
    assert_eq!(again.iter().map(|e| e.id).collect::<Vec<_>>(), fork_ids);

    // Soft-delete C1; the fork survives, and an admin listing with
    // include_deleted sees both.
    ctx.conversations.delete_conversation(&alice, &c1_id).await.unwrap();
    assert!(matches!(
        ctx.conversations.get_conversation(&alice, &c1_id).await,
        Err(EngramError::NotFound(_))
    ));
    let root = admin("root");
    let all = ctx
        .conversations
        .admin_list_conversations(&root, None, true, 100)
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|c| c.id).collect();
    assert!(ids.contains(&c1.id));
    assert!(ids.contains(&c2.id));

    // Fork point must belong to the parent
    let bogus = ctx
        .conversations
        .fork(&alice, &c2_id, &e3.id.to_string(), ForkRequest { title: None })
        .await;
    assert!(matches!(bogus, Err(EngramError::BadRequest(_))));
}

// ═══════════════════════════════════════
// Memory epoch sync
// ═══════════════════════════════════════

#[tokio::test]
async fn test_memory_epoch_sync() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    let epoch1 = ctx
        .conversations
        .sync_memory(&alice, &id, sync_request("agent-a", &["M1", "M2"]))
        .await
        .unwrap();
    assert_eq!(epoch1, 1);

    let epoch2 = ctx
        .conversations
        .sync_memory(&alice, &id, sync_request("agent-a", &["M3"]))
        .await
        .unwrap();
    assert_eq!(epoch2, 2);

    // epoch=None resolves to the latest snapshot
    let latest = ctx
        .conversations
        .list_entries(&alice, &id, Some(Channel::Memory), Some("agent-a".into()), None, None, 100)
        .await
        .unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].content, text_blocks("M3"));
    assert_eq!(latest[0].memory_epoch, Some(2));

    // Prior epochs stay intact for audit
    let first = ctx
        .conversations
        .list_entries(
            &alice,
            &id,
            Some(Channel::Memory),
            Some("agent-a".into()),
            Some(1),
            None,
            100,
        )
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].content, text_blocks("M1"));
    assert_eq!(first[1].content, text_blocks("M2"));

    // Epochs are scoped per client
    let other = ctx
        .conversations
        .sync_memory(&alice, &id, sync_request("agent-b", &["B1"]))
        .await
        .unwrap();
    assert_eq!(other, 1);

    assert_eq!(
        ctx.conversations
            .latest_memory_epoch(&alice, &id, "agent-a")
            .await
            .unwrap(),
        Some(2)
    );
}

// ═══════════════════════════════════════
// Share and downgrade
// ═══════════════════════════════════════

#[tokio::test]
async fn test_share_and_downgrade() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let bob = user("bob");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    // bob cannot even see it yet
    assert!(ctx.conversations.get_conversation(&bob, &id).await.is_err());

    ctx.conversations
        .share(
            &alice,
            &id,
            ShareRequest { user_id: "bob".into(), access_level: AccessLevel::Writer },
        )
        .await
        .unwrap();

    // bob can append
    ctx.conversations.append_entry(&bob, &id, append_history("from bob")).await.unwrap();

    // bob (WRITER) cannot share with carol
    let denied = ctx
        .conversations
        .share(
            &bob,
            &id,
            ShareRequest { user_id: "carol".into(), access_level: AccessLevel::Reader },
        )
        .await;
    assert!(matches!(denied, Err(EngramError::Forbidden(_))));

    // Promote bob to MANAGER; now he can share up to WRITER
    ctx.conversations
        .update_membership(&alice, &id, "bob", AccessLevel::Manager)
        .await
        .unwrap();
    ctx.conversations
        .share(
            &bob,
            &id,
            ShareRequest { user_id: "carol".into(), access_level: AccessLevel::Reader },
        )
        .await
        .unwrap();
    let too_high = ctx
        .conversations
        .share(
            &bob,
            &id,
            ShareRequest { user_id: "carol".into(), access_level: AccessLevel::Manager },
        )
        .await;
    assert!(matches!(too_high, Err(EngramError::Forbidden(_))));

    // carol (READER) cannot append
    let carol = user("carol");
    let read_only = ctx.conversations.append_entry(&carol, &id, append_history("nope")).await;
    assert!(matches!(read_only, Err(EngramError::Forbidden(_))));

    // One membership change covers the whole fork tree: carol can read a
    // fork she was never individually invited to.
    let entries = ctx
        .conversations
        .list_entries(&carol, &id, None, None, None, None, 10)
        .await
        .unwrap();
    let fork = ctx
        .conversations
        .fork(
            &alice,
            &id,
            &entries[0].id.to_string(),
            ForkRequest { title: None },
        )
        .await
        .unwrap();
    ctx.conversations
        .get_conversation(&carol, &fork.id.to_string())
        .await
        .unwrap();
}

// ═══════════════════════════════════════
// Ownership transfer
// ═══════════════════════════════════════

#[tokio::test]
async fn test_ownership_transfer() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let bob = user("bob");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    let transfer = ctx.conversations.request_transfer(&alice, &id, "bob").await.unwrap();

    // alice is still OWNER until acceptance
    let memberships = ctx.conversations.list_memberships(&alice, &id).await.unwrap();
    let alice_level = memberships.iter().find(|m| m.user_id == "alice").unwrap().access_level;
    assert_eq!(alice_level, AccessLevel::Owner);

    // Only the recipient can accept
    let wrong = ctx
        .conversations
        .accept_transfer(&alice, &transfer.id.to_string())
        .await;
    assert!(matches!(wrong, Err(EngramError::Forbidden(_))));

    let accepted = ctx
        .conversations
        .accept_transfer(&bob, &transfer.id.to_string())
        .await
        .unwrap();
    assert_eq!(accepted.status, engram_types::TransferStatus::Accepted);

    let memberships = ctx.conversations.list_memberships(&bob, &id).await.unwrap();
    let level_of = |user: &str| {
        memberships
            .iter()
            .find(|m| m.user_id == user)
            .map(|m| m.access_level)
    };
    assert_eq!(level_of("bob"), Some(AccessLevel::Owner));
    assert_eq!(level_of("alice"), Some(AccessLevel::Manager));

    // A second accept conflicts
    let double = ctx
        .conversations
        .accept_transfer(&bob, &transfer.id.to_string())
        .await;
    assert!(matches!(double, Err(EngramError::Conflict(_))));

    // The listing shows the resolved transfer from both sides
    let initiated = ctx
        .conversations
        .list_transfers(&alice, TransferRole::Initiator)
        .await
        .unwrap();
    assert_eq!(initiated.len(), 1);
    let received = ctx
        .conversations
        .list_transfers(&bob, TransferRole::Recipient)
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
}

// ═══════════════════════════════════════
// Key rotation across service restarts
// ═══════════════════════════════════════

#[tokio::test]
async fn test_key_rotation_preserves_old_rows() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();
    ctx.conversations
        .append_entry(&alice, &id, append_history("written under the old key"))
        .await
        .unwrap();

    // Restart with a rotated chain: new primary key, old key as legacy
    let rotated = TestContext::with_pool_and_chain(
        ctx.pool.clone(),
        test_chain(vec![[77u8; 32], test_utils::TEST_KEY]),
    )
    .await;
    let entries = rotated
        .conversations
        .list_entries(&alice, &id, None, None, None, None, 10)
        .await
        .unwrap();
    assert_eq!(entries[0].content, text_blocks("written under the old key"));

    rotated
        .conversations
        .append_entry(&alice, &id, append_history("written under the new key"))
        .await
        .unwrap();

    // Both vintages decrypt through the rotated chain
    let both = rotated
        .conversations
        .list_entries(&alice, &id, None, None, None, None, 10)
        .await
        .unwrap();
    assert_eq!(both.len(), 2);

    // A chain that lost the original key cannot open the old rows
    let amnesiac =
        TestContext::with_pool_and_chain(ctx.pool.clone(), test_chain(vec![[77u8; 32]])).await;
    let result = amnesiac
        .conversations
        .list_entries(&alice, &id, None, None, None, None, 10)
        .await;
    assert!(matches!(result, Err(EngramError::DecryptionFailed(_))));
}

// ═══════════════════════════════════════
// Resume across nodes
// ═══════════════════════════════════════

#[tokio::test]
async fn test_resume_across_nodes() {
    let ctx = TestContext::new().await;
    let node2 = TestContext::with_pool_and_chain(
        ctx.pool.clone(),
        test_chain(vec![test_utils::TEST_KEY]),
    )
    .await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    // Node 1 owns the live recording
    let recording = ctx
        .resumer
        .recorder_with_address(&id, "node1:8080")
        .await
        .unwrap();
    recording.record("Hel").await.unwrap();
    recording.record("lo ").await.unwrap();

    // Resume on node 2 redirects to node 1
    match node2.resumer.replay_with_address(&id, "node2:8080").await.unwrap() {
        Replay::Redirect(address) => assert_eq!(address, "node1:8080"),
        _ => panic!("expected a redirect to the owning node"),
    }

    // Resume on node 1 sees the prefix immediately, then live tokens
    let Replay::Stream(stream) = ctx
        .resumer
        .replay_with_address(&id, "node1:8080")
        .await
        .unwrap()
    else {
        panic!("expected a stream")
    };
    let collector = tokio::spawn(async move {
        stream.collect::<Vec<String>>().await.join("")
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    recording.record("wor").await.unwrap();
    recording.record("ld").await.unwrap();
    recording.complete().await;
    assert_eq!(collector.await.unwrap(), "Hello world");

    // Within the retention window the full recording replays again
    let Replay::Stream(stream) = ctx
        .resumer
        .replay_with_address(&id, "node1:8080")
        .await
        .unwrap()
    else {
        panic!("expected a retained stream")
    };
    let text = stream.collect::<Vec<String>>().await.join("");
    assert_eq!(text, "Hello world");
}

// ═══════════════════════════════════════
// Streaming responses through the adapter
// ═══════════════════════════════════════

#[tokio::test]
async fn test_streamed_response_materializes_one_entry() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    let tokens: Vec<engram::Result<String>> = ["Hel", "lo ", "wor", "ld"]
        .into_iter()
        .map(|t| Ok(t.to_string()))
        .collect();
    let upstream = futures::stream::iter(tokens);
    let client_stream = ctx
        .conversations
        .clone()
        .stream_response(&alice, &id, Some("agent-a".into()), None, Box::pin(upstream))
        .await
        .unwrap();
    let live: String = client_stream.collect::<Vec<String>>().await.join("");
    assert_eq!(live, "Hello world");

    // The persistence task races the stream end; give it a moment
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let entries = ctx
        .conversations
        .list_entries(&alice, &id, None, None, None, None, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1, "exactly one materialized agent entry");
    assert_eq!(entries[0].content, text_blocks("Hello world"));
    assert_eq!(entries[0].client_id.as_deref(), Some("agent-a"));
    assert!(entries[0].user_id.is_none());
}

#[tokio::test]
async fn test_cancelled_stream_persists_partial() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();

    let recording = ctx
        .resumer
        .recorder_with_address(&id, "node1:8080")
        .await
        .unwrap();
    let cancel_handle = recording.clone();
    let upstream = Box::pin(async_stream::stream! {
        yield engram::Result::Ok("partial".to_string());
        cancel_handle.cancel();
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            yield Ok(" never".to_string());
        }
    });

    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let outcome = pump(upstream, recording, tx, None).await;
    assert!(outcome.cancelled);
    assert!(outcome.text.starts_with("partial"));
}

// ═══════════════════════════════════════
// Episodic memory
// ═══════════════════════════════════════

#[tokio::test]
async fn test_episodic_put_search_filter() {
    let ctx = TestContext::new().await;
    let alice = user("alice");

    let item = ctx
        .episodic
        .put(
            &alice,
            MemoryPutRequest {
                namespace: vec!["user".into(), "alice".into(), "notes".into()],
                key: "python_tip".into(),
                value: serde_json::json!({"text": "Alice prefers list comprehensions."}),
                attributes: Some(serde_json::json!({"topic": "python"})),
                index_fields: Some(vec!["text".into()]),
                ttl_seconds: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(item.key, "python_tip");

    // Attribute-filtered search returns the item with a null score
    let found = ctx
        .episodic
        .search(
            &alice,
            MemorySearchRequest {
                namespace_prefix: vec!["user".into(), "alice".into()],
                query: None,
                filter: Some(
                    serde_json::json!({"topic": "python"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key, "python_tip");
    assert!(found[0].score.is_none());
    assert_eq!(
        found[0].value.as_ref().unwrap()["text"],
        "Alice prefers list comprehensions."
    );

    // A mismatched filter returns nothing
    let missed = ctx
        .episodic
        .search(
            &alice,
            MemorySearchRequest {
                namespace_prefix: vec!["user".into(), "alice".into()],
                query: None,
                filter: Some(
                    serde_json::json!({"topic": "rust"}).as_object().cloned().unwrap(),
                ),
                limit: None,
            },
        )
        .await
        .unwrap();
    assert!(missed.is_empty());

    // bob's searches narrow into bob's own subtree and find nothing
    let bob = user("bob");
    let foreign = ctx
        .episodic
        .search(
            &bob,
            MemorySearchRequest {
                namespace_prefix: vec!["user".into(), "alice".into()],
                query: None,
                filter: None,
                limit: None,
            },
        )
        .await
        .unwrap();
    assert!(foreign.is_empty());

    // bob cannot read alice's item directly either
    let denied = ctx
        .episodic
        .get(&bob, &["user".into(), "alice".into(), "notes".into()], "python_tip")
        .await;
    assert!(matches!(denied, Err(EngramError::Forbidden(_))));
}

#[tokio::test]
async fn test_episodic_events_and_delete() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let namespace = vec!["user".to_string(), "alice".to_string()];

    ctx.episodic
        .put(
            &alice,
            MemoryPutRequest {
                namespace: namespace.clone(),
                key: "fact".into(),
                value: serde_json::json!({"text": "v1"}),
                attributes: None,
                index_fields: None,
                ttl_seconds: None,
            },
        )
        .await
        .unwrap();
    ctx.episodic
        .put(
            &alice,
            MemoryPutRequest {
                namespace: namespace.clone(),
                key: "fact".into(),
                value: serde_json::json!({"text": "v2"}),
                attributes: None,
                index_fields: None,
                ttl_seconds: None,
            },
        )
        .await
        .unwrap();
    ctx.episodic.delete(&alice, &namespace, "fact").await.unwrap();

    let page = ctx
        .episodic
        .list_events(&alice, Some(namespace.clone()), None, None, None, None, 100)
        .await
        .unwrap();
    let kinds: Vec<_> = page.events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![MemoryEventKind::Add, MemoryEventKind::Update, MemoryEventKind::Delete]
    );
    // Snapshots ride on add/update; delete carries none
    assert_eq!(page.events[0].value.as_ref().unwrap()["text"], "v1");
    assert_eq!(page.events[1].value.as_ref().unwrap()["text"], "v2");
    assert!(page.events[2].value.is_none());

    // Cursor pagination picks up after the first event
    let first_page = ctx
        .episodic
        .list_events(&alice, Some(namespace.clone()), None, None, None, None, 1)
        .await
        .unwrap();
    let rest = ctx
        .episodic
        .list_events(
            &alice,
            Some(namespace),
            None,
            None,
            None,
            first_page.next_cursor,
            100,
        )
        .await
        .unwrap();
    assert_eq!(rest.events.len(), 2);

    // The deleted item is gone
    let gone = ctx
        .episodic
        .get(&alice, &["user".into(), "alice".into()], "fact")
        .await;
    assert!(matches!(gone, Err(EngramError::NotFound(_))));
}

#[tokio::test]
async fn test_episodic_ttl_expiry() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    ctx.episodic
        .put(
            &alice,
            MemoryPutRequest {
                namespace: vec!["user".into(), "alice".into()],
                key: "ephemeral".into(),
                value: serde_json::json!({"text": "short-lived"}),
                attributes: None,
                index_fields: None,
                ttl_seconds: Some(0),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let expired = ctx.episodic.expire_due(10).await.unwrap();
    assert_eq!(expired, 1);

    let page = ctx
        .episodic
        .list_events(
            &alice,
            Some(vec!["user".into(), "alice".into()]),
            Some(vec![MemoryEventKind::Expired]),
            None,
            None,
            None,
            10,
        )
        .await
        .unwrap();
    assert_eq!(page.events.len(), 1);
    assert!(page.events[0].value.is_none());
}

// ═══════════════════════════════════════
// Attachments
// ═══════════════════════════════════════

#[tokio::test]
async fn test_attachment_link_clears_expiry() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let entry = ctx
        .conversations
        .append_entry(&alice, &convo.id.to_string(), append_history("with attachment"))
        .await
        .unwrap();

    let created = ctx
        .attachments
        .create(&alice, Some("report.pdf".into()), "application/pdf".into())
        .await
        .unwrap();
    assert!(created.expires_at.is_some());

    ctx.attachments
        .upload(&alice, &created.id.to_string(), b"pdf bytes".to_vec())
        .await
        .unwrap();
    let linked = ctx
        .attachments
        .link(&alice, &created.id.to_string(), &entry.id.to_string())
        .await
        .unwrap();
    assert!(linked.expires_at.is_none(), "linking clears the TTL");
    assert_eq!(linked.entry_id, Some(entry.id));

    // A linked attachment survives the cleanup sweep
    let swept = ctx.attachments.sweep_expired(100).await.unwrap();
    assert_eq!(swept, 0);
}

// ═══════════════════════════════════════
// Full-text search fallback
// ═══════════════════════════════════════

#[tokio::test]
async fn test_fulltext_search_fallback() {
    let ctx = TestContext::new().await;
    let alice = user("alice");
    let convo = ctx
        .conversations
        .create_conversation(&alice, CreateConversationRequest::default())
        .await
        .unwrap();
    let id = convo.id.to_string();
    let entry = ctx
        .conversations
        .append_entry(&alice, &id, append_history("the quick brown fox"))
        .await
        .unwrap();

    // No background worker in tests: drive the index task by hand
    ctx.conversations.index_entry(&entry.id.to_string()).await.unwrap();

    let response = ctx
        .conversations
        .search(
            &alice,
            engram_types::SearchRequest {
                query: "quick fox".into(),
                limit: None,
                conversation_ids: None,
                before: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(response.search_type, "fulltext");
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].entry_id, entry.id);
    assert!(response.hits[0].score.is_none());

    // bob sees nothing
    let bob = user("bob");
    let empty = ctx
        .conversations
        .search(
            &bob,
            engram_types::SearchRequest {
                query: "quick fox".into(),
                limit: None,
                conversation_ids: None,
                before: None,
            },
        )
        .await
        .unwrap();
    assert!(empty.hits.is_empty());
}
