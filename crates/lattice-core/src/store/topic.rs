//! Replicated topic handle.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

pub(super) struct TopicShared<T> {
    #[allow(dead_code)]
    name: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> TopicShared<T> {
    pub(super) fn new(name: String) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

/// Handle onto a named topic.
///
/// Every subscriber, on any handle built against the same backing topic,
/// receives every published value in publish order, on a dispatch task owned
/// by its subscription.
pub struct Topic<T> {
    shared: Arc<TopicShared<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Topic<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(super) fn from_shared(shared: Arc<TopicShared<T>>) -> Self {
        Self { shared }
    }

    /// Publishes `value` to every subscriber.
    pub fn publish(&self, value: T) {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .expect("topic subscriber lock poisoned");
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Registers a subscriber. Values are handled on a dedicated dispatch
    /// task, serialized per subscription.
    pub fn subscribe(&self, handler: impl Fn(T) + Send + 'static) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                handler(value);
            }
        });
        self.shared
            .subscribers
            .lock()
            .expect("topic subscriber lock poisoned")
            .push(tx);
    }
}
