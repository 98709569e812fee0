use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rpb_contracts::{ChangeMessage, MessageType};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const SUBSCRIBER_BUFFER: usize = 32;

/// Receiving half handed to a side-channel connection.
pub struct Subscription {
    pub id: String,
    pub receiver: mpsc::Receiver<String>,
}

/// Live side-channel subscribers. Broadcast is best-effort: a full or closed
/// subscriber is logged and skipped, and closed ones are dropped.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    subscribers: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<String>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = ulid::Ulid::new().to_string();
        self.lock().insert(id.clone(), sender);
        tracing::debug!(subscriber_id = %id, "subscriber registered");
        Subscription { id, receiver }
    }

    pub fn deregister(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            tracing::debug!(subscriber_id = %id, "subscriber deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many subscribers accepted the message.
    pub fn broadcast(&self, message_type: MessageType) -> usize {
        let payload = match serde_json::to_string(&ChangeMessage::new(message_type)) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode change message");
                return 0;
            }
        };

        let mut delivered = 0;
        self.lock().retain(|id, sender| match sender.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber_id = %id,
                    message_type = message_type.as_str(),
                    "subscriber lagging; message dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::info!(subscriber_id = %id, "subscriber gone; removing");
                false
            }
        });

        tracing::debug!(message_type = message_type.as_str(), delivered, "change broadcast");
        delivered
    }
}
