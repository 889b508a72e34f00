/// Reconciliation tests: the engine driven end to end against in-memory collaborators
mod common;

use chatsync_core::hub::{HubCommand, HubEvent, SendTarget};
use chatsync_core::messenger_types::{Attachment, MessageKind};
use chatsync_core::unread::{seen_by, SeenBy};
use chatsync_core::{
    Config, ConversationKey, EngineUpdate, ReadState, ReconcileMode, SessionContext, SyncError,
};
use common::*;
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<EngineUpdate>) -> Vec<EngineUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        out.push(update);
    }
    out
}

fn failed(updates: &[EngineUpdate], action: &str) -> bool {
    updates
        .iter()
        .any(|u| matches!(u, EngineUpdate::RequestFailed { action: a, .. } if a == action))
}

fn legacy() -> Config {
    Config {
        reconcile_mode: ReconcileMode::Legacy,
        ..Config::default()
    }
}

fn me() -> SessionContext {
    SessionContext::begin(ME, Some("token".to_string()))
}

#[tokio::test]
async fn test_open_marks_read_without_reordering() {
    let history = (1..=20)
        .map(|i| record(&format!("m{}", i), "xavier", "hi"))
        .collect();
    let mut h = Harness::new(
        vec![direct("a", "alice", 0), direct("x", "xavier", 3), direct("b", "bob", 1)],
        vec![("x", history)],
    )
    .await;
    assert_eq!(h.unread("x"), 3);

    h.open("x").await;

    assert_eq!(h.thread_ids().len(), 20);
    assert_eq!(h.unread("x"), 0);
    assert_eq!(h.list_ids(), vec!["a", "x", "b"]);
    assert_eq!(h.view().unread().total(), 1);
    assert_eq!(h.call_count("mark_read x").await, 1);
}

#[tokio::test]
async fn test_reopen_is_idempotent() {
    let mut h = Harness::new(vec![direct("x", "xavier", 2)], vec![]).await;
    h.open("x").await;
    h.open("x").await;

    assert_eq!(h.unread("x"), 0);
    assert_eq!(h.call_count("fetch_history x").await, 1);
    assert_eq!(h.call_count("mark_read x").await, 1);
}

#[tokio::test]
async fn test_offline_send_confirmed_exactly_once() {
    let mut h = Harness::new(vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;

    h.hub.disconnect("network down");
    h.settle().await;
    assert!(!h.view().is_connected());

    let temp = h.rec().send_message(Some("Hello".to_string()), None).unwrap();
    assert_eq!(temp.as_str(), "temp-1");
    assert!(temp.is_placeholder());
    assert_eq!(h.hub.outbox().len(), 1);

    h.hub.reconnect();
    h.settle().await;
    assert!(h.view().is_connected());
    assert_eq!(h.thread_ids(), vec!["temp-1"]);

    let (_, _, correlation) = sent_messages(&h.hub)[0].clone();
    let mut echo = incoming("srv-9", "c1", ME, "Hello");
    echo.correlation_id = Some(correlation);
    h.receive(echo.clone());
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["srv-9"]);
    let hellos = h
        .view()
        .active_thread()
        .iter()
        .filter(|m| m.content.as_deref() == Some("Hello"))
        .count();
    assert_eq!(hellos, 1);

    // Redelivery changes nothing
    h.receive(echo);
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["srv-9"]);
}

#[tokio::test]
async fn test_reconnect_refetches_list_and_open_thread() {
    let mut h = Harness::new(vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;

    h.hub.disconnect("sleep");
    h.settle().await;
    h.api
        .set_history("c1", vec![record("missed", "bob", "while you were away")])
        .await;
    h.hub.reconnect();
    h.settle().await;

    assert_eq!(h.call_count("list_conversations").await, 2);
    assert_eq!(h.thread_ids(), vec!["missed"]);
}

/// History reloaded on reconnect already carries the server copy of an offline send
async fn echo_after_reloaded_history(config: Config) -> Vec<String> {
    let mut h = Harness::with(config, me(), vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;

    h.hub.disconnect("network down");
    h.settle().await;
    h.rec().send_message(Some("Hello".to_string()), None).unwrap();

    h.api.set_history("c1", vec![record("srv-9", ME, "Hello")]).await;
    h.hub.reconnect();
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["srv-9", "temp-1"]);

    h.receive(incoming("srv-9", "c1", ME, "Hello"));
    h.settle().await;
    h.thread_ids()
}

#[tokio::test]
async fn test_duplicate_echo_clears_placeholder_after_reload() {
    assert_eq!(echo_after_reloaded_history(Config::default()).await, vec!["srv-9"]);
}

#[tokio::test]
async fn test_legacy_duplicate_echo_clears_placeholder_after_reload() {
    assert_eq!(echo_after_reloaded_history(legacy()).await, vec!["srv-9"]);
}

#[tokio::test]
async fn test_duplicate_from_peer_keeps_my_placeholder() {
    let mut h = Harness::new(
        vec![direct("c1", "bob", 0)],
        vec![("c1", vec![record("b-1", "bob", "yo")])],
    )
    .await;
    h.open("c1").await;
    h.rec().send_message(Some("pending".to_string()), None).unwrap();

    h.receive(incoming("b-1", "c1", "bob", "yo"));
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["b-1", "temp-1"]);
}

#[tokio::test]
async fn test_correlated_confirmation_removes_only_its_placeholder() {
    let mut h = Harness::new(vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;

    h.rec().send_message(Some("one".to_string()), None).unwrap();
    h.rec().send_message(Some("two".to_string()), None).unwrap();
    let sent = sent_messages(&h.hub);
    assert_eq!(sent.len(), 2);

    let mut echo = incoming("srv-1", "c1", ME, "one");
    echo.correlation_id = Some(sent[0].2);
    h.receive(echo);
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["temp-2", "srv-1"]);
}

#[tokio::test]
async fn test_legacy_confirmation_discards_every_placeholder() {
    let mut h = Harness::with(legacy(), me(), vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;

    h.rec().send_message(Some("one".to_string()), None).unwrap();
    h.rec().send_message(Some("two".to_string()), None).unwrap();
    let sent = sent_messages(&h.hub);

    let mut echo = incoming("srv-1", "c1", ME, "one");
    echo.correlation_id = Some(sent[0].2);
    h.receive(echo);
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["srv-1"]);
}

#[tokio::test]
async fn test_peer_message_leaves_placeholders_when_correlated() {
    let mut h = Harness::new(vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;
    h.rec().send_message(Some("draft".to_string()), None).unwrap();

    h.receive(incoming("srv-5", "c1", "bob", "hey"));
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["temp-1", "srv-5"]);

    // Our own message without a correlation id falls back to discard-all
    h.receive(incoming("srv-6", "c1", ME, "from my phone"));
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["srv-5", "srv-6"]);
}

#[tokio::test]
async fn test_peer_message_discards_placeholders_in_legacy_mode() {
    let mut h = Harness::with(legacy(), me(), vec![direct("c1", "bob", 0)], vec![]).await;
    h.open("c1").await;
    h.rec().send_message(Some("draft".to_string()), None).unwrap();

    h.receive(incoming("srv-5", "c1", "bob", "hey"));
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["srv-5"]);
}

#[tokio::test]
async fn test_stale_history_never_displayed() {
    let mut h = Harness::new(
        vec![direct("A", "ann", 0), direct("B", "ben", 0)],
        vec![
            ("A", vec![record("old-1", "ann", "stale")]),
            ("B", vec![record("b1", "ben", "hi")]),
        ],
    )
    .await;

    let gate = h.api.hold_history("A").await;
    h.rec().open_conversation("A").unwrap();
    h.chat.settle_until(1).await;

    h.rec().open_conversation("B").unwrap();
    h.api
        .set_history("A", vec![record("new-1", "ann", "fresh")])
        .await;
    h.rec().open_conversation("A").unwrap();

    // Everything but the held first fetch of A has landed
    h.chat.settle_until(1).await;
    assert_eq!(h.view().active(), Some(&ConversationKey::id("A")));
    assert_eq!(h.thread_ids(), vec!["new-1"]);

    let _ = gate.send(());
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["new-1"]);
}

#[tokio::test]
async fn test_non_open_message_bumps_unread_and_order() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 0), direct("b", "bob", 0), direct("c", "carl", 2)],
        vec![],
    )
    .await;
    h.open("a").await;

    h.receive(incoming("c-1", "c", "carl", "yo"));
    h.settle().await;
    assert_eq!(h.list_ids(), vec!["c", "a", "b"]);
    assert_eq!(h.unread("c"), 3);
    let snippet = h.view().conversations().get("c").unwrap().last_message.clone().unwrap();
    assert_eq!(snippet.content, "yo");
    assert_eq!(snippet.sender, "carl");
    assert!(h.thread_ids().is_empty());

    // Duplicate delivery
    h.receive(incoming("c-1", "c", "carl", "yo"));
    h.settle().await;
    assert_eq!(h.unread("c"), 3);

    // Our own message from elsewhere moves the conversation but is not unread
    h.receive(incoming("b-1", "b", ME, "sent from my phone"));
    h.settle().await;
    assert_eq!(h.list_ids(), vec!["b", "c", "a"]);
    assert_eq!(h.unread("b"), 0);
}

#[tokio::test]
async fn test_open_message_appends_and_marks_read() {
    let mut h = Harness::new(vec![direct("b", "bob", 0), direct("a", "alice", 0)], vec![]).await;
    h.open("a").await;
    assert_eq!(h.list_ids(), vec!["b", "a"]);

    h.emit(HubEvent::TypingStarted {
        conversation_id: "a".to_string(),
        user: "alice".to_string(),
    });
    h.settle().await;
    assert_eq!(h.view().presence().typing_in("a"), vec!["alice"]);

    h.receive(incoming("m1", "a", "alice", "hey"));
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["m1"]);
    assert_eq!(h.list_ids(), vec!["a", "b"]);
    assert_eq!(h.unread("a"), 0);
    assert!(h.view().presence().typing_in("a").is_empty());
    assert_eq!(h.call_count("mark_read a").await, 2);
}

#[tokio::test]
async fn test_unknown_conversation_triggers_refetch() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    h.api
        .set_conversations(vec![direct("a", "alice", 0), direct("n", "nina", 1)])
        .await;

    h.receive(incoming("n-1", "n", "nina", "hello"));
    h.settle().await;

    assert_eq!(h.call_count("list_conversations").await, 2);
    assert!(h.view().conversations().contains("n"));
    assert_eq!(h.unread("n"), 1);

    h.receive(incoming("n-1", "n", "nina", "hello"));
    h.settle().await;
    assert_eq!(h.unread("n"), 1);
}

#[tokio::test]
async fn test_refetches_coalesce() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;

    for id in ["n-1", "n-2", "n-3"] {
        h.receive(incoming(id, "n", "nina", "ping"));
    }
    h.settle().await;

    // Initial load, one in flight, one coalesced follow-up
    assert_eq!(h.call_count("list_conversations").await, 3);
}

#[tokio::test]
async fn test_pending_conversation_promoted_by_echo() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;

    let key = h.rec().open_with_peer("zoe").unwrap();
    assert_eq!(key, ConversationKey::pending("zoe"));

    h.rec().send_message(Some("hi".to_string()), None).unwrap();
    let sent = sent_messages(&h.hub);
    assert_eq!(sent[0].0, SendTarget::Peer("zoe".to_string()));
    assert_eq!(h.thread_ids(), vec!["temp-1"]);

    let mut echo = incoming("srv-1", "c-new", ME, "hi");
    echo.correlation_id = Some(sent[0].2);
    h.receive(echo);
    h.settle().await;

    assert_eq!(h.view().active(), Some(&ConversationKey::id("c-new")));
    assert_eq!(h.list_ids(), vec!["c-new", "a"]);
    assert_eq!(h.thread_ids(), vec!["srv-1"]);
    let conv = h.view().conversations().get("c-new").unwrap();
    assert_eq!(conv.peer_of(ME).map(String::as_str), Some("zoe"));
    assert_eq!(h.view().session().last_active.as_deref(), Some("c-new"));
}

#[tokio::test]
async fn test_pending_conversation_promoted_by_peer_reply() {
    let mut h = Harness::new(vec![], vec![]).await;
    h.rec().open_with_peer("zoe").unwrap();

    h.receive(incoming("z-1", "c-z", "zoe", "hello there"));
    h.settle().await;

    assert_eq!(h.view().active(), Some(&ConversationKey::id("c-z")));
    assert_eq!(h.thread_ids(), vec!["z-1"]);
    assert_eq!(h.unread("c-z"), 0);
}

#[tokio::test]
async fn test_open_with_peer_reuses_existing_direct() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let key = h.rec().open_with_peer("alice").unwrap();
    assert_eq!(key, ConversationKey::id("a"));

    let err = h.rec().open_with_peer(ME).unwrap_err();
    assert!(matches!(err, SyncError::InvalidAction(_)));
}

#[tokio::test]
async fn test_group_read_receipts_seen_by() {
    let mut h = Harness::new(
        vec![group("g", &[ME, "b", "c", "d", "e"], 0)],
        vec![("g", vec![record("m1", ME, "hello team")])],
    )
    .await;
    h.open("g").await;

    for (reader, ids) in [("b", None), ("c", Some(vec!["m1".to_string()])), ("b", None)] {
        h.emit(HubEvent::MessagesRead {
            conversation_id: "g".to_string(),
            reader: reader.to_string(),
            message_ids: ids,
        });
    }
    h.settle().await;

    let msg = h.view().active_thread()[0].clone();
    match &msg.read {
        ReadState::Group { read_by } => {
            assert_eq!(read_by.iter().collect::<Vec<_>>(), vec!["b", "c"]);
        }
        other => panic!("expected group read state, got {:?}", other),
    }
    let conv = h.view().conversations().get("g").unwrap();
    assert_eq!(seen_by(&msg, conv), SeenBy { seen: 2, of: 4 });
}

#[tokio::test]
async fn test_edit_and_delete_events() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 0)],
        vec![("a", vec![record("m1", "alice", "x"), record("m2", ME, "y")])],
    )
    .await;
    h.open("a").await;

    h.emit(HubEvent::MessageEdited {
        conversation_id: "a".to_string(),
        message_id: "m1".to_string(),
        content: "x2".to_string(),
    });
    h.emit(HubEvent::MessageEdited {
        conversation_id: "a".to_string(),
        message_id: "ghost".to_string(),
        content: "boo".to_string(),
    });
    h.emit(HubEvent::MessageDeleted {
        conversation_id: "a".to_string(),
        message_id: "m2".to_string(),
    });
    h.emit(HubEvent::MessageDeleted {
        conversation_id: "zzz".to_string(),
        message_id: "m2".to_string(),
    });
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["m1"]);
    let m1 = &h.view().active_thread()[0];
    assert_eq!(m1.content.as_deref(), Some("x2"));
    assert!(m1.edited);
}

#[tokio::test]
async fn test_edit_and_delete_actions() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 0)],
        vec![("a", vec![record("m1", "alice", "x"), record("m2", ME, "y")])],
    )
    .await;
    h.open("a").await;

    h.rec().edit_message("m2", "fixed").unwrap();
    h.settle().await;
    assert_eq!(h.view().active_thread()[1].content.as_deref(), Some("fixed"));
    assert!(h.hub.sent().iter().any(|c| matches!(
        c,
        HubCommand::EditMessage { message_id, .. } if message_id == "m2"
    )));

    let err = h.rec().edit_message("m1", "not mine").unwrap_err();
    assert!(matches!(err, SyncError::InvalidAction(_)));
    let err = h.rec().delete_message("ghost").unwrap_err();
    assert!(matches!(err, SyncError::MessageNotFound(_)));

    h.rec().delete_message("m2").unwrap();
    h.settle().await;
    assert_eq!(h.thread_ids(), vec!["m1"]);
}

#[tokio::test]
async fn test_failed_request_leaves_store_unchanged() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 0)],
        vec![("a", vec![record("m2", ME, "keep me")])],
    )
    .await;
    h.open("a").await;
    let mut updates = h.view().subscribe_updates();

    h.api.set_failing("delete_message", true).await;
    h.rec().delete_message("m2").unwrap();
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["m2"]);
    assert!(failed(&drain(&mut updates), "delete_message"));
    assert!(h.hub.sent().iter().all(|c| !matches!(c, HubCommand::DeleteMessage { .. })));
}

#[tokio::test]
async fn test_clear_history() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 0)],
        vec![("a", vec![record("m1", "alice", "x")])],
    )
    .await;
    h.open("a").await;
    h.receive(incoming("m2", "a", "alice", "latest"));
    h.settle().await;
    h.rec().send_message(Some("pending".to_string()), None).unwrap();

    h.rec().clear_history("a").unwrap();
    h.settle().await;

    assert_eq!(h.thread_ids(), vec!["temp-1"]);
    assert!(h.view().conversations().get("a").unwrap().last_message.is_none());
    assert!(h.hub.sent().iter().any(|c| matches!(c, HubCommand::ClearChat { .. })));

    let err = h.rec().clear_history("nope").unwrap_err();
    assert!(matches!(err, SyncError::UnknownConversation(_)));
}

#[tokio::test]
async fn test_leave_group_and_block_contact() {
    let mut h = Harness::new(
        vec![group("g", &[ME, "b", "c"], 0), direct("a", "alice", 0)],
        vec![],
    )
    .await;

    let err = h.rec().leave_group("a").unwrap_err();
    assert!(matches!(err, SyncError::InvalidAction(_)));

    h.open("g").await;
    h.rec().leave_group("g").unwrap();
    h.settle().await;
    assert_eq!(h.list_ids(), vec!["a"]);
    assert!(h.view().active().is_none());
    assert!(h.hub.sent().iter().any(|c| matches!(c, HubCommand::LeaveGroup { .. })));

    h.open("a").await;
    h.rec().block_contact("alice").unwrap();
    h.settle().await;
    assert!(h.view().conversations().is_empty());
    assert!(h.view().active().is_none());
    assert_eq!(h.api.blocked().await, vec!["alice"]);

    assert!(h.rec().block_contact(ME).is_err());
}

#[tokio::test]
async fn test_membership_and_group_lifecycle() {
    let mut h = Harness::new(vec![group("g", &[ME, "b"], 0)], vec![]).await;

    h.emit(HubEvent::MembershipChanged {
        conversation_id: "g".to_string(),
        added: vec!["c".to_string()],
        removed: vec!["b".to_string()],
    });
    h.emit(HubEvent::GroupCreated {
        conversation: group("g2", &[ME, "x"], 0),
    });
    h.emit(HubEvent::GroupCreated {
        conversation: group("g2", &[ME, "x"], 0),
    });
    h.settle().await;

    assert_eq!(h.view().conversations().get("g").unwrap().participants, vec![ME, "c"]);
    assert_eq!(h.list_ids(), vec!["g2", "g"]);

    h.open("g").await;
    h.emit(HubEvent::MembershipChanged {
        conversation_id: "g".to_string(),
        added: vec![],
        removed: vec![ME.to_string()],
    });
    h.settle().await;
    assert_eq!(h.list_ids(), vec!["g2"]);
    assert!(h.view().active().is_none());

    h.emit(HubEvent::MembershipChanged {
        conversation_id: "unknown".to_string(),
        added: vec!["q".to_string()],
        removed: vec![],
    });
    h.settle().await;
    assert_eq!(h.call_count("list_conversations").await, 2);
}

#[tokio::test]
async fn test_events_for_unknown_conversation_refetch() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let mut updates = h.view().subscribe_updates();

    h.emit(HubEvent::TypingStarted {
        conversation_id: "zzz".to_string(),
        user: "nina".to_string(),
    });
    h.settle().await;
    assert_eq!(h.call_count("list_conversations").await, 2);
    assert!(h.view().presence().typing_in("zzz").is_empty());
    assert!(drain(&mut updates)
        .iter()
        .all(|u| !matches!(u, EngineUpdate::TypingChanged { .. })));

    h.emit(HubEvent::MessagesRead {
        conversation_id: "yyy".to_string(),
        reader: "nina".to_string(),
        message_ids: None,
    });
    h.settle().await;
    assert_eq!(h.call_count("list_conversations").await, 3);

    // Own events are still ignored without a refetch
    h.emit(HubEvent::TypingStarted {
        conversation_id: "zzz".to_string(),
        user: ME.to_string(),
    });
    h.settle().await;
    assert_eq!(h.call_count("list_conversations").await, 3);

    // Known conversations are applied directly
    h.emit(HubEvent::TypingStarted {
        conversation_id: "a".to_string(),
        user: "alice".to_string(),
    });
    h.settle().await;
    assert_eq!(h.view().presence().typing_in("a"), vec!["alice"]);
    assert_eq!(h.call_count("list_conversations").await, 3);
}

#[tokio::test]
async fn test_initial_selection_prefers_requested_then_persisted() {
    let mut session = me();
    session.last_active = Some("b".to_string());
    let h = Harness::with(
        Config::default(),
        session.clone(),
        vec![direct("a", "alice", 0), direct("b", "bob", 0)],
        vec![],
    )
    .await;
    assert_eq!(h.view().active(), Some(&ConversationKey::id("b")));

    let mut h = Harness::unsettled(
        Config::default(),
        session.clone(),
        vec![direct("a", "alice", 0), direct("b", "bob", 0)],
        vec![],
    )
    .await;
    h.rec().open_conversation("a").unwrap();
    h.settle().await;
    assert_eq!(h.view().active(), Some(&ConversationKey::id("a")));

    session.last_active = Some("gone".to_string());
    let h = Harness::with(Config::default(), session, vec![direct("a", "alice", 0)], vec![]).await;
    assert!(h.view().active().is_none());
}

#[tokio::test]
async fn test_open_unknown_waits_for_refetch() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let mut updates = h.view().subscribe_updates();

    h.api
        .set_conversations(vec![direct("a", "alice", 0), direct("later", "lee", 0)])
        .await;
    h.open("later").await;
    assert_eq!(h.view().active(), Some(&ConversationKey::id("later")));

    h.open("nope").await;
    assert_eq!(h.view().active(), Some(&ConversationKey::id("later")));
    assert!(failed(&drain(&mut updates), "open_conversation"));
}

#[tokio::test]
async fn test_mark_read_failure_keeps_unread() {
    let mut h = Harness::new(vec![direct("x", "xavier", 3)], vec![]).await;
    let mut updates = h.view().subscribe_updates();
    h.api.set_failing("mark_read", true).await;

    h.open("x").await;
    assert_eq!(h.unread("x"), 3);
    assert!(failed(&drain(&mut updates), "mark_read"));
}

#[tokio::test]
async fn test_mark_read_keeps_arrivals_after_dispatch() {
    let mut h = Harness::new(vec![direct("x", "xavier", 3), direct("a", "alice", 0)], vec![]).await;

    h.rec().open_conversation("x").unwrap();
    h.rec().open_conversation("a").unwrap();
    h.receive(incoming("x-4", "x", "xavier", "one more"));
    h.settle().await;

    assert_eq!(h.unread("x"), 1);
}

#[tokio::test]
async fn test_send_validation() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let err = h.rec().send_message(Some("hi".to_string()), None).unwrap_err();
    assert!(matches!(err, SyncError::NoActiveConversation));

    h.open("a").await;
    let err = h.rec().send_message(Some("   ".to_string()), None).unwrap_err();
    assert!(matches!(err, SyncError::InvalidAction(_)));

    let picture = Attachment {
        url: "https://cdn.example/cat.png".to_string(),
        file_name: Some("cat.png".to_string()),
        mime_type: Some("image/png".to_string()),
        size_bytes: Some(2048),
    };
    h.rec().send_message(None, Some(picture)).unwrap();
    assert_eq!(h.view().active_thread()[0].kind, MessageKind::Image);

    h.hub.set_rejecting(true);
    let err = h.rec().send_message(Some("lost".to_string()), None).unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(h.thread_ids(), vec!["temp-1"]);
}

#[tokio::test]
async fn test_presence_and_self_typing() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let mut updates = h.view().subscribe_updates();

    h.emit(HubEvent::OnlineList {
        users: vec!["b".to_string(), "a".to_string()],
    });
    h.emit(HubEvent::PresenceChanged {
        user: "c".to_string(),
        online: true,
    });
    h.emit(HubEvent::PresenceChanged {
        user: "a".to_string(),
        online: false,
    });
    h.emit(HubEvent::TypingStarted {
        conversation_id: "a".to_string(),
        user: ME.to_string(),
    });
    h.settle().await;

    assert_eq!(h.view().presence().online(), vec!["b", "c"]);
    assert!(h.view().presence().typing_in("a").is_empty());
    let updates = drain(&mut updates);
    assert_eq!(
        updates.iter().filter(|u| **u == EngineUpdate::PresenceChanged).count(),
        3
    );
}

#[tokio::test]
async fn test_connection_updates() {
    let mut h = Harness::new(vec![direct("a", "alice", 0)], vec![]).await;
    let mut updates = h.view().subscribe_updates();

    h.hub.disconnect("wifi");
    h.settle().await;
    h.hub.reconnect();
    h.settle().await;

    let updates = drain(&mut updates);
    assert!(updates.contains(&EngineUpdate::ConnectionChanged { connected: false }));
    assert!(updates.contains(&EngineUpdate::ConnectionChanged { connected: true }));
    assert_eq!(h.call_count("list_conversations").await, 2);
}

#[tokio::test]
async fn test_snapshot_serializes() {
    let mut h = Harness::new(
        vec![direct("a", "alice", 1)],
        vec![("a", vec![record("m1", "alice", "x")])],
    )
    .await;
    h.open("a").await;

    let snapshot = h.view().snapshot();
    assert_eq!(snapshot.active_thread.len(), 1);
    assert_eq!(snapshot.total_unread, 0);
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"activeThread\""));
}
