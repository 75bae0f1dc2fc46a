//! Transcript reconciliation across push, poll and optimistic delivery.

mod common;

use chat_realtime_sync::{
    DeliverySource, DeliveryState, HistoryStore, MessageId, PollingConfig, SyncConfig, SyncError,
    TranscriptChange, TransportEvent,
};
use common::{
    admin_conversation, at, settle, stored, test_config, OpenBehavior, TestHarness, ADMIN, USER,
};
use std::time::Duration;
use tokio::time::sleep;

fn fast_polling() -> SyncConfig {
    SyncConfig {
        polling: PollingConfig {
            base_interval: Duration::from_millis(500),
            ..PollingConfig::default()
        },
        ..test_config(false)
    }
}

fn inserted_count(harness: &TestHarness) -> usize {
    harness
        .events()
        .iter()
        .filter(|event| matches!(event.change, TranscriptChange::Inserted { .. }))
        .count()
}

/// The same row arriving by push and by poll is delivered once.
#[tokio::test(start_paused = true)]
async fn test_push_and_poll_deliver_once() {
    let harness = TestHarness::push();
    let handle = harness
        .manager
        .subscribe(harness.admin_descriptor())
        .await
        .expect("push subscription");
    settle().await;

    let message = stored(7, ADMIN, USER, "hello", at(0));
    harness.fetcher.insert(message.clone());
    harness.connector.emit(TransportEvent::Change {
        channel: handle.name().to_string(),
        message,
    });
    settle().await;
    assert_eq!(inserted_count(&harness), 1);
    assert_eq!(harness.events()[0].source, DeliverySource::Push);

    // Drop the connection for good so polling fetches the same row.
    harness.connector.set_behavior(OpenBehavior::Reject);
    harness.connector.emit(TransportEvent::Closed { reason: None });
    settle().await;
    sleep(Duration::from_millis(5_001)).await;
    settle().await;

    assert!(harness.fetcher.call_count() >= 1);
    assert_eq!(harness.contents(&admin_conversation()), vec!["hello"]);
    assert_eq!(inserted_count(&harness), 1);
}

/// Push for a channel the manager no longer holds is dropped.
#[tokio::test(start_paused = true)]
async fn test_change_for_unknown_channel_dropped() {
    let harness = TestHarness::push();
    harness.manager.subscribe(harness.admin_descriptor()).await;
    settle().await;

    harness.connector.emit(TransportEvent::Change {
        channel: "chat-somebody-else".into(),
        message: stored(9, ADMIN, USER, "stray", at(0)),
    });
    settle().await;

    assert!(harness.events().is_empty());
    assert!(harness.manager.transcript(&admin_conversation()).is_empty());
}

/// Transcripts stay sorted by creation time whatever the arrival order.
#[tokio::test(start_paused = true)]
async fn test_transcript_sorted_by_created_at() {
    let harness = TestHarness::new(fast_polling());
    harness.fetcher.insert(stored(3, ADMIN, USER, "third", at(3_000)));
    harness.fetcher.insert(stored(1, USER, ADMIN, "first", at(1_000)));
    harness.fetcher.insert(stored(2, ADMIN, USER, "second", at(2_000)));

    assert!(harness.manager.subscribe(harness.admin_descriptor()).await.is_none());
    sleep(Duration::from_millis(501)).await;
    settle().await;

    assert_eq!(
        harness.contents(&admin_conversation()),
        vec!["first", "second", "third"]
    );

    harness.fetcher.insert(stored(4, ADMIN, USER, "zeroth", at(0)));
    sleep(Duration::from_millis(501)).await;
    settle().await;

    assert_eq!(
        harness.contents(&admin_conversation()),
        vec!["zeroth", "first", "second", "third"]
    );
}

/// Optimistic "hi" is replaced in place by the stored row (id 42) that a
/// poll returns before the insert call itself resolves.
#[tokio::test(start_paused = true)]
async fn test_optimistic_message_confirmed_by_poll() {
    let harness = TestHarness::new(fast_polling());
    harness.outbound.set_ack_delay(Duration::from_secs(1));
    harness.manager.subscribe(harness.admin_descriptor()).await;

    let receipt = harness
        .manager
        .send_message(&admin_conversation(), "hi")
        .await
        .unwrap();

    assert_eq!(receipt.delivery, DeliveryState::Delivered);
    assert_eq!(
        receipt.stored.as_ref().and_then(|m| m.id.clone()),
        Some(MessageId::from(42))
    );

    let transcript = harness.manager.transcript(&admin_conversation());
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].local_id, receipt.local_id);
    assert_eq!(transcript[0].message.id, Some(MessageId::from(42)));
    assert_eq!(transcript[0].message.content, "hi");

    let changes: Vec<_> = harness
        .events()
        .iter()
        .map(|event| (event.change, event.source))
        .collect();
    assert_eq!(
        changes,
        vec![
            (
                TranscriptChange::Pending {
                    local_id: receipt.local_id
                },
                DeliverySource::Local
            ),
            (
                TranscriptChange::Confirmed {
                    local_id: receipt.local_id
                },
                DeliverySource::Poll
            ),
        ]
    );

    // History holds the stored row only.
    let history = harness.history.load(&admin_conversation()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, Some(MessageId::from(42)));
}

/// When the insert resolves first, the receipt itself confirms the entry.
#[tokio::test(start_paused = true)]
async fn test_optimistic_message_confirmed_by_ack() {
    let harness = TestHarness::new(fast_polling());
    harness.manager.subscribe(harness.admin_descriptor()).await;

    let receipt = harness
        .manager
        .send_message(&admin_conversation(), "hello admin")
        .await
        .unwrap();
    assert_eq!(receipt.delivery, DeliveryState::Delivered);

    // The next poll returns the same row and changes nothing.
    sleep(Duration::from_millis(501)).await;
    settle().await;

    let transcript = harness.manager.transcript(&admin_conversation());
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].delivery, DeliveryState::Delivered);
    assert_eq!(harness.events().len(), 2);
}

/// A rejected insert leaves the entry in the transcript marked failed.
#[tokio::test(start_paused = true)]
async fn test_failed_send_stays_visible() {
    let harness = TestHarness::push();
    harness.manager.subscribe(harness.admin_descriptor()).await;
    settle().await;
    harness.outbound.fail(true);

    let receipt = harness
        .manager
        .send_message(&admin_conversation(), "lost")
        .await
        .unwrap();

    assert_eq!(receipt.delivery, DeliveryState::Failed);
    assert!(receipt.stored.is_none());
    let transcript = harness.manager.transcript(&admin_conversation());
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].delivery, DeliveryState::Failed);
    assert_eq!(
        harness.events().last().map(|event| event.change),
        Some(TranscriptChange::Failed {
            local_id: receipt.local_id
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_outside_conversation_rejected() {
    let harness = TestHarness::push();
    let foreign = chat_realtime_sync::ConversationKey::new("u2", ADMIN);

    let result = harness.manager.send_message(&foreign, "hi").await;

    assert!(matches!(result, Err(SyncError::NotParticipant(_))));
    assert!(harness.manager.transcript(&foreign).is_empty());
}

/// Poll failures grow the interval; the next success restores it.
#[tokio::test(start_paused = true)]
async fn test_poll_failures_back_off() {
    let harness = TestHarness::polling();
    harness.fetcher.fail_next(2);
    harness.manager.subscribe(harness.admin_descriptor()).await;

    sleep(Duration::from_millis(23_751)).await;
    settle().await;

    let calls: Vec<u128> = harness
        .fetcher
        .call_times()
        .iter()
        .map(Duration::as_millis)
        .collect();
    assert_eq!(calls, vec![5_000, 12_500, 23_750]);
    let status = harness.manager.status();
    assert!(status.polling);
    assert_eq!(status.consecutive_poll_failures, 0);
    assert_eq!(status.poll_interval, Duration::from_secs(5));
}
