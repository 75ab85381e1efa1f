//! Best-effort point-to-point signaling between authenticated devices.
//!
//! The hub delivers a payload at most once to the addressed device if it is
//! currently connected, and drops it otherwise. There is no store-and-forward:
//! a re-subscription starts from now. Messages from one sender to one
//! recipient arrive in send order; nothing is guaranteed across senders.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;

/// Per-subscriber buffer. When a subscriber's buffer is full the message is
/// dropped rather than blocking the hub.
pub const SIGNAL_BUFFER: usize = 64;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    TransferRequest(TransferRequest),
    TransferReject { id: String },
    TransferCancel { id: String },
}

/// A payload together with the sending device's id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub payload: SignalPayload,
}

#[derive(Clone, Default)]
pub struct SignalHub {
    devices: Arc<RwLock<HashMap<String, mpsc::Sender<Envelope>>>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `device_id` and returns its incoming message stream. Any
    /// previous subscription for the same device is replaced.
    pub fn subscribe(&self, device_id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        self.devices.write().insert(device_id.to_string(), tx);
        rx
    }

    /// Delivers `payload` to `to` if it is connected. Returns whether the
    /// message was handed to the recipient's buffer.
    pub fn send(&self, from: &str, to: &str, payload: SignalPayload) -> bool {
        let sender = match self.devices.read().get(to) {
            Some(sender) => sender.clone(),
            None => {
                log::debug!("signal from {from} to {to} dropped: not connected");
                return false;
            },
        };

        let envelope = Envelope {
            from: from.to_string(),
            payload,
        };
        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("signal from {from} to {to} dropped: subscriber buffer full");
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.devices.write().remove(to);
                log::debug!("signal from {from} to {to} dropped: subscriber gone");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> SignalPayload {
        SignalPayload::TransferRequest(TransferRequest {
            id: id.to_string(),
            file_name: "report.pdf".to_string(),
            file_size: 1024,
        })
    }

    #[tokio::test]
    async fn test_delivery_and_sender_order() {
        let hub = SignalHub::new();
        let mut rx = hub.subscribe("b");

        for i in 0..5 {
            assert!(hub.send("a", "b", request(&i.to_string())));
        }

        for i in 0..5 {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.from, "a");
            assert_eq!(envelope.payload, request(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_unconnected_recipient_drops() {
        let hub = SignalHub::new();
        assert!(!hub.send("a", "nobody", request("1")));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let hub = SignalHub::new();
        let _rx = hub.subscribe("b");

        for i in 0..SIGNAL_BUFFER {
            assert!(hub.send("a", "b", request(&i.to_string())));
        }
        assert!(!hub.send("a", "b", request("overflow")));
    }

    #[tokio::test]
    async fn test_resubscribe_starts_from_now() {
        let hub = SignalHub::new();
        let _old = hub.subscribe("b");
        assert!(hub.send("a", "b", request("before")));

        let mut rx = hub.subscribe("b");
        assert!(hub.send("a", "b", request("after")));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.payload, request("after"));
    }

    #[tokio::test]
    async fn test_payload_json_shape() {
        let json = serde_json::to_string(&request("abc")).unwrap();
        assert!(json.contains("\"type\":\"transfer_request\""));
        assert!(json.contains("\"file_size\":1024"));
    }
}
