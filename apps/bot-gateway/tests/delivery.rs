mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use gsm_bot_gateway::{ActivityHandler, ActivityOutcome, BotState, ManagerError};
use gsm_bus::{BusError, MemoryTransport};
use gsm_core::{Activity, TenantGate};
use gsm_session::ConversationStateStore;
use support::{RecordingStore, activity, manager, message, ready_broker};

#[tokio::test]
async fn flaky_broker_still_delivers_exactly_one_event() {
    let transport = MemoryTransport::new();
    let manager = manager(
        TenantGate::allow_all(),
        Arc::new(RecordingStore::new()),
        ready_broker(transport.clone(), 3).await,
    );
    transport.fail_next_publishes(3);

    let outcome = manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap();

    match outcome {
        ActivityOutcome::Accepted {
            attempts, event_id, ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(event_id, "msteams:a1");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].msg_id, "msteams:a1");
    assert_eq!(transport.publish_attempts(), 4);
}

#[tokio::test]
async fn exhausted_publish_surfaces_as_failure_after_state_write() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 2).await,
    );
    transport.fail_all_publishes();

    let err = manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ManagerError::Publish(BusError::PublishFailed { attempts: 3, .. })
    ));
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert!(transport.published().await.is_empty());
}

#[tokio::test]
async fn store_outage_does_not_block_publishing() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    store.fail_all();
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 3).await,
    );

    let outcome = manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ActivityOutcome::Accepted {
            state_cached: false,
            ..
        }
    ));
    assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].json()["turn"], 1);
}

#[tokio::test]
async fn turns_accumulate_across_activities() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 3).await,
    );

    for id in ["a1", "a2", "a3"] {
        manager
            .handle_activity(message("acme", "conv-1", id))
            .await
            .unwrap();
    }

    let cached = store.get("conv-1").await.unwrap().expect("state cached");
    let state = BotState::decode("conv-1", &cached.blob).expect("readable state");
    assert_eq!(state.turns, 3);
    assert_eq!(state.recent_activity_ids, ["a1", "a2", "a3"]);
    let turns: Vec<u64> = transport
        .published()
        .await
        .iter()
        .map(|msg| msg.json()["turn"].as_u64().unwrap_or_default())
        .collect();
    assert_eq!(turns, [1, 2, 3]);
}

#[tokio::test]
async fn unreadable_state_starts_a_fresh_conversation() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    store.put("conv-1", "{not json").await.unwrap();
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 3).await,
    );

    manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap();

    let cached = store.get("conv-1").await.unwrap().unwrap();
    assert_eq!(BotState::decode("conv-1", &cached.blob).unwrap().turns, 1);
}

#[tokio::test]
async fn end_of_conversation_publishes_and_drops_state() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 3).await,
    );

    manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap();
    assert!(store.get("conv-1").await.unwrap().is_some());

    let outcome = manager
        .handle_activity(activity("endOfConversation", "acme", "conv-1", "a2"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ActivityOutcome::Accepted {
            state_cached: false,
            ..
        }
    ));
    assert!(store.get("conv-1").await.unwrap().is_none());
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
    let published = transport.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].json()["kind"], "end_of_conversation");
    assert_eq!(published[1].json()["turn"], 2);
}

#[tokio::test]
async fn publish_after_broker_close_is_rejected() {
    let transport = MemoryTransport::new();
    let broker = ready_broker(transport.clone(), 3).await;
    let manager = manager(
        TenantGate::allow_all(),
        Arc::new(RecordingStore::new()),
        broker.clone(),
    );
    broker.close(Duration::from_millis(100)).await.unwrap();

    let err = manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Publish(BusError::BrokerClosed)));
    assert_eq!(transport.publish_attempts(), 0);
}

fn without_id(mut activity: Activity) -> Activity {
    activity.id = None;
    activity
}

fn event_id_of(outcome: ActivityOutcome) -> String {
    match outcome {
        ActivityOutcome::Accepted { event_id, .. } => event_id,
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn activities_without_ids_get_distinct_event_ids_while_store_is_down() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    store.fail_all();
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 3).await,
    );

    let mut ids = Vec::new();
    for _ in 0..2 {
        let outcome = manager
            .handle_activity(without_id(message("acme", "conv-1", "unused")))
            .await
            .unwrap();
        ids.push(event_id_of(outcome));
    }

    assert_ne!(ids[0], ids[1]);
    let published = transport.published().await;
    assert_eq!(published.len(), 2);
    assert_ne!(published[0].msg_id, published[1].msg_id);
    let minted = published[0].json()["payload"]["id"].as_str().map(str::to_string);
    assert_eq!(
        minted.map(|id| format!("msteams:{id}")).as_deref(),
        Some(published[0].msg_id.as_str())
    );
}

#[tokio::test]
async fn activities_without_ids_stay_distinct_across_end_of_conversation() {
    let transport = MemoryTransport::new();
    let manager = manager(
        TenantGate::allow_all(),
        Arc::new(RecordingStore::new()),
        ready_broker(transport.clone(), 3).await,
    );

    let before = manager
        .handle_activity(without_id(message("acme", "conv-1", "unused")))
        .await
        .unwrap();
    manager
        .handle_activity(activity("endOfConversation", "acme", "conv-1", "eoc"))
        .await
        .unwrap();
    let after = manager
        .handle_activity(without_id(message("acme", "conv-1", "unused")))
        .await
        .unwrap();

    assert_ne!(event_id_of(before), event_id_of(after));
    let msg_ids: Vec<String> = transport
        .published()
        .await
        .iter()
        .map(|msg| msg.msg_id.clone())
        .collect();
    assert_eq!(msg_ids.len(), 3);
    assert_ne!(msg_ids[0], msg_ids[2]);
}

#[tokio::test]
async fn redelivery_after_failed_publish_reuses_the_turn() {
    let transport = MemoryTransport::new();
    let store = Arc::new(RecordingStore::new());
    let manager = manager(
        TenantGate::allow_all(),
        store.clone(),
        ready_broker(transport.clone(), 0).await,
    );
    transport.fail_next_publishes(1);

    manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap_err();
    manager
        .handle_activity(message("acme", "conv-1", "a1"))
        .await
        .unwrap();

    let cached = store.get("conv-1").await.unwrap().unwrap();
    let state = BotState::decode("conv-1", &cached.blob).unwrap();
    assert_eq!(state.turns, 1);
    assert_eq!(state.recent_activity_ids, ["a1"]);
    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].json()["turn"], 1);
}
