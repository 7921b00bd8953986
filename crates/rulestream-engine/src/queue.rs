//! In-memory event queue
//!
//! At-least-once delivery over an unbounded channel. A nacked delivery is
//! re-sent after its delay with `attempt + 1` until `max_deliveries` is
//! reached, after which it lands in the dead-letter list.

use async_trait::async_trait;
use parking_lot::Mutex;
use rulestream_core::{Delivery, Error, EventQueue, Result, TriggerInstance};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
}

impl QueueStats {
    /// Every published instance was acked or dead-lettered
    pub fn is_settled(&self) -> bool {
        self.in_flight == 0 && self.acked + self.dead_lettered == self.published
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

pub struct InMemoryQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    max_deliveries: u32,
    next_delivery: AtomicU64,
    in_flight: Mutex<HashMap<String, Delivery>>,
    dead_letters: Mutex<Vec<Delivery>>,
    counters: Arc<Counters>,
}

impl InMemoryQueue {
    pub fn new(max_deliveries: u32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            max_deliveries: max_deliveries.max(1),
            next_delivery: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Enqueue a trigger instance for its first delivery
    pub fn publish(&self, instance: TriggerInstance) -> Result<()> {
        let delivery = Delivery {
            delivery_id: self.delivery_id(),
            instance,
            attempt: 1,
        };
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| Error::queue("queue is closed"))?;
        sender
            .send(delivery)
            .map_err(|_| Error::queue("queue receiver dropped"))?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting new instances. Receivers drain what is queued and
    /// pending redeliveries, then see the end of the queue.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }

    /// Deliveries that exhausted `max_deliveries`
    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters.lock().clone()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.counters.published.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            redelivered: self.counters.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.lock().len() as u64,
        }
    }

    fn delivery_id(&self) -> String {
        format!("d-{}", self.next_delivery.fetch_add(1, Ordering::Relaxed))
    }

    fn take_in_flight(&self, delivery: &Delivery) -> Result<Delivery> {
        self.in_flight
            .lock()
            .remove(&delivery.delivery_id)
            .ok_or_else(|| Error::queue(format!("unknown delivery {}", delivery.delivery_id)))
    }

    fn dead_letter(&self, delivery: Delivery) {
        warn!(
            trigger_instance = %delivery.instance.id,
            attempt = delivery.attempt,
            "Delivery dead-lettered"
        );
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.lock().push(delivery);
    }
}

#[async_trait]
impl EventQueue for InMemoryQueue {
    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut receiver = self.receiver.lock().await;
        let Some(delivery) = receiver.recv().await else {
            return Ok(None);
        };
        self.in_flight
            .lock()
            .insert(delivery.delivery_id.clone(), delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.take_in_flight(delivery)?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        debug!(trigger_instance = %delivery.instance.id, "Delivery acked");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let delivery = self.take_in_flight(delivery)?;
        if delivery.attempt >= self.max_deliveries {
            self.dead_letter(delivery);
            return Ok(());
        }

        // pending redeliveries hold their own sender and survive close()
        let Some(sender) = self.sender.lock().clone() else {
            self.dead_letter(delivery);
            return Ok(());
        };

        let next = Delivery {
            delivery_id: self.delivery_id(),
            instance: delivery.instance,
            attempt: delivery.attempt + 1,
        };
        debug!(
            trigger_instance = %next.instance.id,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling redelivery"
        );
        self.counters.redelivered.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = sender.send(next);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(id: &str) -> TriggerInstance {
        TriggerInstance::new("core.st2.generic", json!({})).with_id(id)
    }

    #[tokio::test]
    async fn test_receive_and_ack() {
        let queue = InMemoryQueue::new(3);
        queue.publish(instance("ti-1")).unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(queue.stats().in_flight, 1);

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats();
        assert_eq!(stats.acked, 1);
        assert!(stats.is_settled());

        // acking twice is an error
        assert!(queue.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = InMemoryQueue::new(2);
        queue.publish(instance("ti-1")).unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first, Duration::ZERO).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.instance.id, "ti-1");
        assert_ne!(second.delivery_id, first.delivery_id);

        queue.nack(&second, Duration::ZERO).await.unwrap();
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 2);

        let stats = queue.stats();
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert!(stats.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_waits_for_delay() {
        let queue = InMemoryQueue::new(5);
        queue.publish(instance("ti-1")).unwrap();
        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first, Duration::from_secs(30)).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(10), queue.receive()).await;
        assert!(early.is_err());

        let later = queue.receive().await.unwrap().unwrap();
        assert_eq!(later.attempt, 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = InMemoryQueue::new(3);
        queue.publish(instance("ti-1")).unwrap();
        queue.close();

        assert!(queue.publish(instance("ti-2")).is_err());
        assert!(queue.receive().await.unwrap().is_some());
        assert!(queue.receive().await.unwrap().is_none());
    }
}
