//! Per-conversation arrival ordering.
//!
//! Each conversation id gets two FIFO locks taken hand over hand: the state lock covers
//! load, derive and persist; the publish lock is acquired before the state lock is released
//! and covers only the publish. The next activity of the same conversation can therefore
//! prepare its state while the previous one is still publishing, yet its own publish queues
//! behind it. Conversations never contend with each other, and a conversation's entry is
//! dropped once no task references it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct Slot {
    state: Arc<Mutex<()>>,
    publish: Arc<Mutex<()>>,
}

type Slots = Arc<DashMap<String, Arc<Slot>>>;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    slots: Slots,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for this conversation's earlier activities to finish their state step.
    pub async fn lock(&self, conversation_id: &str) -> ConversationTurn {
        let slot = self
            .slots
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        let lease = Lease {
            slots: self.slots.clone(),
            key: conversation_id.to_string(),
            slot,
        };
        let state = lease.slot.state.clone().lock_owned().await;
        ConversationTurn { state, lease }
    }

    /// Conversations with at least one task holding or waiting for a lock.
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

/// Exclusive right to read and write one conversation's state.
pub struct ConversationTurn {
    // Declared before `lease` so the guard is released before the slot is reclaimed.
    state: OwnedMutexGuard<()>,
    lease: Lease,
}

impl ConversationTurn {
    /// Queues for the publish lock, then releases the state lock.
    pub async fn begin_publish(self) -> PublishTurn {
        let ConversationTurn { state, lease } = self;
        let publish = lease.slot.publish.clone().lock_owned().await;
        drop(state);
        PublishTurn {
            _publish: publish,
            _lease: lease,
        }
    }
}

/// Exclusive right to publish the next event of one conversation.
pub struct PublishTurn {
    _publish: OwnedMutexGuard<()>,
    _lease: Lease,
}

struct Lease {
    slots: Slots,
    key: String,
    slot: Arc<Slot>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The map and this lease are the only holders when nobody else is queued.
        self.slots.remove_if(&self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn same_conversation_runs_in_arrival_order() {
        let locks = ConversationLocks::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = locks.lock("conv").await;
        let second = {
            let locks = locks.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let turn = locks.lock("conv").await;
                tx.send("second-state").unwrap();
                let _publish = turn.begin_publish().await;
                tx.send("second-publish").unwrap();
            })
        };
        tokio::task::yield_now().await;

        tx.send("first-state").unwrap();
        let publish = first.begin_publish().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send("first-publish").unwrap();
        drop(publish);
        second.await.unwrap();
        drop(tx);

        let mut order = Vec::new();
        while let Some(step) = rx.recv().await {
            order.push(step);
        }
        assert_eq!(
            order,
            ["first-state", "second-state", "first-publish", "second-publish"]
        );
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn other_conversations_do_not_wait() {
        let locks = ConversationLocks::new();
        let _held = locks.lock("a").await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(other.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn entries_are_reclaimed() {
        let locks = ConversationLocks::new();
        {
            let turn = locks.lock("a").await;
            let _publish = turn.begin_publish().await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
