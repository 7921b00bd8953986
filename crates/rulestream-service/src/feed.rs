//! JSON-lines trigger instance feed

use rulestream_core::TriggerInstance;
use rulestream_engine::InMemoryQueue;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines read by one feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub published: u64,
    pub rejected: u64,
}

/// Publish one trigger instance per non-empty line until EOF or
/// cancellation. Lines that do not decode are logged and skipped.
pub async fn feed_events<R>(
    reader: R,
    queue: &InMemoryQueue,
    cancel: &CancellationToken,
) -> anyhow::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<TriggerInstance>(line) {
            Ok(instance) => {
                debug!(
                    trigger_instance = %instance.id,
                    trigger = %instance.trigger_type,
                    "Trigger instance received"
                );
                queue.publish(instance)?;
                stats.published += 1;
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed trigger instance");
                stats.rejected += 1;
            }
        }
    }

    info!(
        published = stats.published,
        rejected = stats.rejected,
        "Event feed finished"
    );
    Ok(stats)
}

/// Wait until every published instance is acked or dead-lettered, then
/// close the queue so the dispatcher can stop
pub async fn close_when_settled(queue: &InMemoryQueue, cancel: &CancellationToken) {
    while !queue.stats().is_settled() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    queue.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulestream_core::EventQueue;

    #[tokio::test]
    async fn test_feeds_valid_lines_and_skips_bad_ones() {
        let input = concat!(
            r#"{"id": "ti-1", "trigger_type": "core.st2.generic", "payload": {"severity": 7}}"#,
            "\n",
            "\n",
            "not json\n",
            r#"{"trigger_type": "core.st2.webhook"}"#,
            "\n",
        );
        let queue = InMemoryQueue::new(3);
        let cancel = CancellationToken::new();

        let stats = feed_events(input.as_bytes(), &queue, &cancel).await.unwrap();

        assert_eq!(stats, FeedStats { published: 2, rejected: 1 });
        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.instance.id, "ti-1");
        assert_eq!(first.instance.payload["severity"], 7);
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.instance.trigger_type, "core.st2.webhook");
        assert!(!second.instance.id.is_empty());
    }

    #[tokio::test]
    async fn test_close_when_settled() {
        let queue = InMemoryQueue::new(3);
        let cancel = CancellationToken::new();
        queue
            .publish(TriggerInstance::new("t", serde_json::json!({})))
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        close_when_settled(&queue, &cancel).await;

        assert!(queue.receive().await.unwrap().is_none());
    }
}
