//! In-memory queue.
//!
//! Same delivery contract as the Redis backend: leases, redelivery with an
//! increasing receive count, and a dead-letter list. Receipts are bound to a
//! single delivery, so a consumer whose lease ran out and whose message was
//! handed to someone else gets `QueueError::LeaseLost`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use intake_models::JobDescriptor;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::{DeadLetter, Envelope};
use crate::error::{QueueError, QueueResult};
use crate::queue::JobQueue;

#[derive(Debug)]
struct Message {
    payload: String,
    visible_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct State {
    created: bool,
    next_id: u64,
    messages: BTreeMap<u64, Message>,
    acknowledged: Vec<String>,
    dead_letters: Vec<DeadLetter>,
    idempotency: HashMap<String, (JobDescriptor, Instant)>,
}

/// Queue kept in process memory. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    poll_wait: Duration,
    available: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            poll_wait: Duration::from_millis(100),
            available: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    /// How long `receive` waits when nothing is visible.
    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Simulate the backing service going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }

    /// Message ids acknowledged so far, in order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Dead letters so far, in order.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Payloads still in the queue, in publish order.
    pub fn pending_payloads(&self) -> Vec<String> {
        self.lock()
            .messages
            .values()
            .map(|m| m.payload.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.available.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::connection_failed(format!(
                "queue {} unavailable",
                self.name
            )))
        }
    }

    /// Resolve a receipt to its message id, rejecting stale deliveries.
    fn held_message(state: &State, receipt: &str) -> QueueResult<u64> {
        let (id, delivery) = parse_receipt(receipt)?;
        match state.messages.get(&id) {
            Some(message) if message.delivery_count == delivery => Ok(id),
            _ => Err(QueueError::lease_lost(receipt)),
        }
    }

    fn take_visible(&self, max_messages: usize, lease: Duration) -> Vec<Envelope> {
        let now = Instant::now();
        let lease_expires_at = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());

        let mut state = self.lock();
        let mut envelopes = Vec::new();
        for (id, message) in state.messages.iter_mut() {
            if envelopes.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.delivery_count += 1;
            message.visible_at = now + lease;
            envelopes.push(Envelope {
                receipt: format!("{}.{}", id, message.delivery_count),
                message_id: id.to_string(),
                payload: message.payload.clone(),
                delivery_count: message.delivery_count,
                lease_expires_at,
            });
        }
        envelopes
    }

    /// Earliest instant at which a currently leased message turns visible.
    fn next_visible_at(&self) -> Option<Instant> {
        self.lock().messages.values().map(|m| m.visible_at).min()
    }
}

fn parse_receipt(receipt: &str) -> QueueResult<(u64, u32)> {
    let (id, delivery) = receipt
        .split_once('.')
        .ok_or_else(|| QueueError::lease_lost(receipt))?;
    let id = id.parse().map_err(|_| QueueError::lease_lost(receipt))?;
    let delivery = delivery.parse().map_err(|_| QueueError::lease_lost(receipt))?;
    Ok((id, delivery))
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        if !state.created {
            debug!("Created in-memory queue {}", self.name);
            state.created = true;
        }
        Ok(())
    }

    async fn publish(&self, payload: &str) -> QueueResult<String> {
        self.check_available()?;
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.messages.insert(
                id,
                Message {
                    payload: payload.to_string(),
                    visible_at: Instant::now(),
                    delivery_count: 0,
                },
            );
            id
        };
        self.notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn receive(&self, max_messages: usize, lease: Duration) -> QueueResult<Vec<Envelope>> {
        self.check_available()?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.poll_wait;
        loop {
            // Registered before inspecting state so a publish in between still wakes us.
            let notified = self.notify.notified();

            let envelopes = self.take_visible(max_messages, lease);
            if !envelopes.is_empty() {
                return Ok(envelopes);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = self
                .next_visible_at()
                .map(|at| at.min(deadline))
                .unwrap_or(deadline)
                .max(now);

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, envelope: &Envelope) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let id = Self::held_message(&state, &envelope.receipt)?;
        state.messages.remove(&id);
        state.acknowledged.push(envelope.message_id.clone());
        Ok(())
    }

    async fn extend_lease(&self, envelope: &Envelope, duration: Duration) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let id = Self::held_message(&state, &envelope.receipt)?;
        if let Some(message) = state.messages.get_mut(&id) {
            message.visible_at = Instant::now() + duration;
        }
        Ok(())
    }

    async fn release(&self, envelope: &Envelope) -> QueueResult<()> {
        self.check_available()?;
        {
            let mut state = self.lock();
            let id = Self::held_message(&state, &envelope.receipt)?;
            if let Some(message) = state.messages.get_mut(&id) {
                message.visible_at = Instant::now();
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, envelope: &Envelope, error: &str) -> QueueResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let id = Self::held_message(&state, &envelope.receipt)?;
        state.messages.remove(&id);
        state
            .dead_letters
            .push(DeadLetter::from_envelope(envelope, error));
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        self.check_available()?;
        Ok(self.lock().messages.len() as u64)
    }

    async fn dead_letter_len(&self) -> QueueResult<u64> {
        self.check_available()?;
        Ok(self.lock().dead_letters.len() as u64)
    }

    async fn reserve_idempotency_key(
        &self,
        key: &str,
        job: &JobDescriptor,
        ttl: Duration,
    ) -> QueueResult<Option<JobDescriptor>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.lock();
        state.idempotency.retain(|_, (_, expires)| *expires > now);

        if let Some((existing, _)) = state.idempotency.get(key) {
            return Ok(Some(existing.clone()));
        }
        state
            .idempotency
            .insert(key.to_string(), (job.clone(), now + ttl));
        Ok(None)
    }

    async fn forget_idempotency_key(&self, key: &str) -> QueueResult<()> {
        self.check_available()?;
        self.lock().idempotency.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_receive_leases_message() {
        let queue = MemoryQueue::new("jobs");
        queue.publish("a").await.unwrap();

        let first = queue.receive(10, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, "a");
        assert_eq!(first[0].delivery_count, 1);

        // Leased: invisible to the next receive
        let second = queue.receive(10, LEASE).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_redelivers() {
        let queue = MemoryQueue::new("jobs");
        queue.publish("a").await.unwrap();

        let first = queue.receive(1, LEASE).await.unwrap();
        tokio::time::advance(LEASE + Duration::from_secs(1)).await;

        let again = queue.receive(1, LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].delivery_count, 2);
        assert!(again[0].is_redelivery());

        // The first receipt no longer holds the message
        assert!(matches!(
            queue.acknowledge(&first[0]).await,
            Err(QueueError::LeaseLost(_))
        ));
        tokio_test::assert_ok!(queue.acknowledge(&again[0]).await);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.acknowledged(), vec![first[0].message_id.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lease_keeps_message_hidden() {
        let queue = MemoryQueue::new("jobs");
        queue.publish("a").await.unwrap();

        let envelopes = queue.receive(1, Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        queue
            .extend_lease(&envelopes[0], Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(queue.receive(1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_makes_visible() {
        let queue = MemoryQueue::new("jobs");
        queue.publish("a").await.unwrap();

        let envelopes = queue.receive(1, LEASE).await.unwrap();
        queue.release(&envelopes[0]).await.unwrap();

        let again = queue.receive(1, LEASE).await.unwrap();
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_removes_message() {
        let queue = MemoryQueue::new("jobs");
        queue.publish("a").await.unwrap();

        let envelopes = queue.receive(1, LEASE).await.unwrap();
        queue.dead_letter(&envelopes[0], "boom").await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_len().await.unwrap(), 1);
        let dead = queue.dead_letters();
        assert_eq!(dead[0].payload, "a");
        assert_eq!(dead[0].error, "boom");
        assert!(queue.acknowledged().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_waits_for_publish() {
        let queue = MemoryQueue::new("jobs").with_poll_wait(Duration::from_secs(5));
        let publisher = queue.clone();

        let handle = tokio::spawn(async move { publisher_after(publisher).await });
        let envelopes = queue.receive(1, LEASE).await.unwrap();
        handle.await.unwrap();

        assert_eq!(envelopes.len(), 1);
    }

    async fn publisher_after(queue: MemoryQueue) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.publish("late").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_max_messages() {
        let queue = MemoryQueue::new("jobs");
        for i in 0..5 {
            queue.publish(&i.to_string()).await.unwrap();
        }

        assert_eq!(queue.receive(2, LEASE).await.unwrap().len(), 2);
        assert_eq!(queue.receive(10, LEASE).await.unwrap().len(), 3);
        assert_eq!(queue.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unavailable_queue_fails() {
        let queue = MemoryQueue::new("jobs");
        queue.set_available(false);

        assert!(matches!(
            queue.publish("a").await,
            Err(QueueError::ConnectionFailed(_))
        ));
        assert!(queue.pending_payloads().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_reservation() {
        let queue = MemoryQueue::new("jobs");
        let job = JobDescriptor::new("app-1", "a.pdf");
        let other = JobDescriptor::new("app-1", "b.pdf");

        assert!(queue
            .reserve_idempotency_key("k", &job, LEASE)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            queue.reserve_idempotency_key("k", &other, LEASE).await.unwrap(),
            Some(job.clone())
        );

        queue.forget_idempotency_key("k").await.unwrap();
        assert!(queue
            .reserve_idempotency_key("k", &other, LEASE)
            .await
            .unwrap()
            .is_none());
    }
}
