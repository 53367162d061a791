use futures::stream::BoxStream;
use futures::StreamExt;
use hodei_common::model::{ExecutionEvent, LogChunk};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

/// Fan-out of execution events. Every subscriber gets its own bounded
/// buffer and the publisher awaits the send: a slow subscriber back-pressures
/// the publisher, events are never dropped.
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::Sender<ExecutionEvent>>>,
    buffer: usize,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer,
        }
    }

    pub async fn subscribe(&self) -> BoxStream<'static, ExecutionEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().await.push(tx);
        ReceiverStream::new(rx).boxed()
    }

    pub async fn publish(&self, event: ExecutionEvent) {
        let mut subscribers = self.subscribers.lock().await;
        Self::fan_out(&mut subscribers, event).await;
    }

    /// Builds, records and fans out one event under the hub lock. `prepare`
    /// stamps the event and appends it wherever it needs to live; keeping
    /// all of that inside the lock gives every subscriber a single
    /// monotonic-timestamp order.
    pub async fn publish_ordered<F>(&self, prepare: F)
    where
        F: FnOnce() -> Option<ExecutionEvent>,
    {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(event) = prepare() {
            Self::fan_out(&mut subscribers, event).await;
        }
    }

    async fn fan_out(subscribers: &mut Vec<mpsc::Sender<ExecutionEvent>>, event: ExecutionEvent) {
        subscribers.retain(|subscriber| !subscriber.is_closed());
        for subscriber in subscribers.iter() {
            let _ = subscriber.send(event.clone()).await;
        }
    }
}

/// Fan-out of log chunks. Backed by a broadcast ring: a subscriber that
/// falls behind loses the oldest chunks and keeps going, and never slows
/// the publisher down.
pub struct LogHub {
    tx: broadcast::Sender<LogChunk>,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> BoxStream<'static, LogChunk> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|chunk| futures::future::ready(chunk.ok()))
            .boxed()
    }

    pub fn publish(&self, chunk: LogChunk) {
        // no receivers is fine; logs are only owed to live subscribers
        let _ = self.tx.send(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use hodei_common::model::{ExecutionEventKind, ExecutionId, LogStream};
    use std::collections::HashMap;
    use test_r::test;

    fn event(message: &str) -> ExecutionEvent {
        ExecutionEvent {
            execution_id: ExecutionId::generate(),
            kind: ExecutionEventKind::Custom,
            message: message.to_string(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    async fn every_event_subscriber_sees_every_event_in_order() {
        let hub = EventHub::new(16);
        let mut first = hub.subscribe().await;
        let mut second = hub.subscribe().await;

        hub.publish(event("one")).await;
        hub.publish(event("two")).await;

        assert_eq!(first.next().await.unwrap().message, "one");
        assert_eq!(first.next().await.unwrap().message, "two");
        assert_eq!(second.next().await.unwrap().message, "one");
        assert_eq!(second.next().await.unwrap().message, "two");
    }

    #[test]
    async fn lagging_log_subscribers_lose_the_oldest_chunks() {
        let hub = LogHub::new(2);
        let mut subscriber = hub.subscribe();

        let execution_id = ExecutionId::generate();
        for i in 0..5 {
            hub.publish(LogChunk {
                execution_id: execution_id.clone(),
                stream: LogStream::Stdout,
                payload: Bytes::from(format!("chunk-{i}")),
                timestamp: Utc::now(),
            });
        }

        // ring capacity is 2: only the newest two survive
        assert_eq!(subscriber.next().await.unwrap().payload, Bytes::from("chunk-3"));
        assert_eq!(subscriber.next().await.unwrap().payload, Bytes::from("chunk-4"));
    }
}
