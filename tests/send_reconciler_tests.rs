// Optimistic send tests
// A send must show up at once as pending, end as exactly one entry whichever
// of the feed echo and the dispatch result arrives first, and surface
// failures on the message itself.

mod common;
use common::{
    conversation, seeded_backend, select_and_wait, setup_logging, spawn_sync, test_config, text_record, wait_for_view,
    AGENT_ID,
};

use anyhow::Result;
use log::info;
use std::time::Duration;

use chatdesk::backend::Change;
use chatdesk::{Direction, MediaKind, MessageContent, MessageStatus, SenderKind, SyncConfig, SyncError};

#[tokio::test]
async fn test_send_shows_pending_then_sent() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.delay_dispatch(Duration::from_millis(300));
    let sync = spawn_sync(&backend, test_config());
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("Thanks, it shipped today").await?;
    info!("Provisional id: {}", id);

    // Visible before the dispatcher has answered
    let current = sync.view();
    assert_eq!(current.messages.len(), 3);
    let pending = current.message(&id).expect("provisional message shown");
    assert_eq!(pending.status, MessageStatus::Pending);
    assert_eq!(pending.direction, Direction::Outbound);
    assert_eq!(pending.sender, SenderKind::Agent);
    assert_eq!(pending.sender_id.as_deref(), Some(AGENT_ID));
    assert_eq!(current.messages.last().map(|m| m.id.as_str()), Some(id.as_str()));

    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Sent), 5).await?;
    let sent = current.message(&id).expect("message still shown");
    assert!(sent.provider_message_id.as_deref().unwrap_or_default().starts_with("wamid."));
    assert!(sent.sent_at.is_some());
    assert_eq!(current.messages.len(), 3);

    let dispatched = backend.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].recipient, "+15550100");
    assert_eq!(dispatched[0].content, MessageContent::text("Thanks, it shipped today"));

    let stored = backend.stored_messages("c1");
    let row = stored.iter().find(|r| r.id.as_deref() == Some(id.as_str())).expect("row persisted");
    assert_eq!(row.status, MessageStatus::Sent);

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_feed_echo_before_dispatch_result_leaves_one_entry() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.assign_server_ids(true);
    backend.echo_writes(true);
    // Give the echoed insert plenty of time to land first
    backend.delay_dispatch(Duration::from_millis(300));
    let sync = spawn_sync(&backend, test_config());
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("On its way").await?;

    let replaced = wait_for_view(&mut view, |v| v.message("srv-1").is_some(), 5).await?;
    assert_eq!(replaced.messages.len(), 3);
    assert_eq!(replaced.message(&id).map(|m| m.id.as_str()), Some("srv-1"));

    let current = wait_for_view(
        &mut view,
        |v| v.message("srv-1").map(|m| m.status) == Some(MessageStatus::Sent),
        5,
    )
    .await?;
    assert_eq!(current.messages.len(), 3);
    assert_eq!(current.messages.iter().filter(|m| m.content == MessageContent::text("On its way")).count(), 1);
    assert_eq!(current.replaced.get(&id).map(String::as_str), Some("srv-1"));

    // Dispatch uses the persisted id
    assert_eq!(backend.dispatched()[0].message_id, "srv-1");

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dispatch_result_before_feed_echo_leaves_one_entry() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.assign_server_ids(true);
    let sync = spawn_sync(&backend, test_config());
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("Tracking number is 1Z999").await?;
    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Sent), 5).await?;
    assert_eq!(current.message(&id).map(|m| m.id.as_str()), Some("srv-1"));

    // The feed delivers the persisted row only now, twice
    let row = backend
        .stored_messages("c1")
        .into_iter()
        .find(|r| r.id.as_deref() == Some("srv-1"))
        .expect("row persisted");
    backend.emit("c1", Change::insert(row.clone()));
    backend.emit("c1", Change::update(row));
    backend.emit(
        "c1",
        Change::insert(text_record("m5", "c1", "Great, thanks", Direction::Inbound, 0)),
    );

    let current = wait_for_view(&mut view, |v| v.message("m5").is_some(), 5).await?;
    assert_eq!(current.messages.len(), 4);
    assert_eq!(current.messages.iter().filter(|m| m.id == "srv-1").count(), 1);
    assert_eq!(current.message(&id).map(|m| m.status), Some(MessageStatus::Sent));

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dispatch_failure_is_visible_on_message() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.fail_dispatch(Some("131026"), "Recipient is not a WhatsApp user");
    let sync = spawn_sync(&backend, test_config());
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("Hello?").await?;
    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Failed), 5).await?;

    let failed = current.message(&id).expect("failed message stays visible");
    let reason = failed.error.clone().unwrap_or_default();
    assert!(reason.contains("131026"), "unexpected reason: {}", reason);
    assert!(reason.contains("not a WhatsApp user"));
    assert!(failed.failed_at.is_some());
    assert_eq!(current.messages.len(), 3);

    let stored = backend.stored_messages("c1");
    let row = stored.iter().find(|r| r.id.as_deref() == Some(id.as_str())).expect("row persisted");
    assert_eq!(row.status, MessageStatus::Failed);
    assert!(row.error_message.is_some());

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_send_times_out_then_recovers() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.delay_dispatch(Duration::from_millis(1500));
    let config = SyncConfig {
        pending_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let sync = spawn_sync(&backend, config);
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("Are you there?").await?;
    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Failed), 5).await?;
    let reason = current.message(&id).and_then(|m| m.error.clone()).unwrap_or_default();
    assert!(reason.contains("No confirmation"), "unexpected reason: {}", reason);

    // The dispatcher answers late; the message is not lost
    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Sent), 5).await?;
    assert!(current.message(&id).and_then(|m| m.error.clone()).is_none());
    assert_eq!(current.messages.len(), 3);

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_send_outcome_after_switch_is_discarded() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    backend.delay_dispatch(Duration::from_millis(300));
    let sync = spawn_sync(&backend, test_config());
    select_and_wait(&sync, "c1").await?;

    let id = sync.send_text("One moment").await?;
    let current = select_and_wait(&sync, "c2").await?;
    assert!(current.message(&id).is_none());

    // Delivery still completes on the backend
    tokio::time::sleep(Duration::from_millis(600)).await;
    let current = sync.view();
    assert_eq!(current.conversation_id.as_deref(), Some("c2"));
    assert_eq!(current.messages.len(), 1);
    assert!(current.message(&id).is_none());

    let stored = backend.stored_messages("c1");
    let row = stored.iter().find(|r| r.id.as_deref() == Some(id.as_str())).expect("row persisted");
    assert_eq!(row.status, MessageStatus::Sent);

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_send_media_message() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    let sync = spawn_sync(&backend, test_config());
    let mut view = sync.watch();
    select_and_wait(&sync, "c1").await?;

    let content = MessageContent::media(
        MediaKind::Document,
        "https://cdn.example.com/invoice.pdf",
        Some("Invoice".to_string()),
    );
    let id = sync.send(content.clone()).await?;
    let current = wait_for_view(&mut view, |v| v.message(&id).map(|m| m.status) == Some(MessageStatus::Sent), 5).await?;

    assert_eq!(current.message(&id).map(|m| m.content.clone()), Some(content.clone()));
    assert_eq!(backend.dispatched()[0].content, content);

    let stored = backend.stored_messages("c1");
    let row = stored.iter().find(|r| r.id.as_deref() == Some(id.as_str())).expect("row persisted");
    assert_eq!(row.message_type, "document");
    assert_eq!(row.media_url.as_deref(), Some("https://cdn.example.com/invoice.pdf"));

    sync.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_send_fails_fast_without_context() -> Result<()> {
    setup_logging();
    let backend = seeded_backend();
    // Conversation whose contact cannot be loaded
    let (mut orphan, contact) = conversation("c7");
    orphan.contact_id = "missing".to_string();
    backend.add_conversation(orphan, contact);
    let sync = spawn_sync(&backend, test_config());

    let result = sync.send_text("hello").await;
    assert!(matches!(result, Err(SyncError::NoActiveConversation)));

    let current = select_and_wait(&sync, "c7").await?;
    assert!(current.contact.is_none());
    let result = sync.send_text("hello").await;
    assert!(matches!(result, Err(SyncError::NoContact(ref id)) if id == "c7"));

    select_and_wait(&sync, "c1").await?;
    let result = sync.send_text("   ").await;
    assert!(matches!(result, Err(SyncError::EmptyMessage)));

    // Nothing was shown, stored or dispatched
    assert_eq!(sync.view().messages.len(), 2);
    assert!(backend.dispatched().is_empty());
    assert!(backend.stored_messages("c7").is_empty());

    sync.shutdown().await;
    Ok(())
}
