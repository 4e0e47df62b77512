use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::message::wire_message::WireMessage;
use crate::relay::relay_events::ConnectionEvent;
use crate::relay::relay_handler::RelayHandler;

/// A [RelayHandler] that records everything it receives, so that test code can wait for it.
///  Clones share their recordings.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
    events: Arc<Mutex<VecDeque<ConnectionEvent>>>,
    changed: Arc<Notify>,
}

impl RecordingHandler {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> RecordingHandler {
        Default::default()
    }

    /// Wait for the next inbound message. Panics if none arrives in time.
    pub async fn next_message(&self) -> WireMessage {
        let raw = Self::next(&self.messages, &self.changed, "message").await;
        WireMessage::parse(&raw)
            .expect("the relay should deliver well-formed messages")
    }

    /// Wait for the next event. Panics if none arrives in time.
    pub async fn next_event(&self) -> ConnectionEvent {
        Self::next(&self.events, &self.changed, "event").await
    }

    async fn next<T>(queue: &Mutex<VecDeque<T>>, changed: &Notify, what: &str) -> T {
        let deadline = Instant::now() + Self::DEFAULT_TIMEOUT;
        loop {
            let notified = changed.notified();
            if let Some(item) = queue.lock().unwrap().pop_front() {
                return item;
            }
            if timeout_at(deadline, notified).await.is_err() {
                panic!("no {} received within {:?}", what, Self::DEFAULT_TIMEOUT);
            }
        }
    }

    /// Wait for `duration` and assert that no event arrived in the meantime
    pub async fn assert_no_event_within(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        let events = self.events.lock().unwrap();
        assert!(events.is_empty(), "unexpected events: {:?}", events);
    }

    pub fn recorded_messages(&self) -> Vec<Bytes> {
        self.messages.lock().unwrap().iter().cloned().collect()
    }

    pub fn recorded_events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl RelayHandler for RecordingHandler {
    fn on_message(&self, message: Bytes) {
        self.messages.lock().unwrap().push_back(message);
        self.changed.notify_waiters();
    }

    fn on_event(&self, event: ConnectionEvent) {
        self.events.lock().unwrap().push_back(event);
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection_key::ConnectionKey;
    use crate::relay::relay_events::EventKind;

    #[tokio::test]
    async fn test_waits_for_recording() {
        let handler = RecordingHandler::new();
        let event = ConnectionEvent::new(ConnectionKey::udp(1), EventKind::Created);

        let h = handler.clone();
        let e = event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.on_event(e);
        });

        assert_eq!(handler.next_event().await, event);
        handler.assert_no_event_within(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    #[should_panic]
    async fn test_times_out() {
        tokio::time::pause();
        RecordingHandler::new().next_message().await;
    }
}
