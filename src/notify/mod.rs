pub mod sms;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Role-scoped event channel. Rendered on the wire as `order:{id}`,
/// `courier:{id}` or `restaurant:{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Order(Uuid),
    Courier(Uuid),
    Restaurant(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Order(id) => write!(f, "order:{id}"),
            Channel::Courier(id) => write!(f, "courier:{id}"),
            Channel::Restaurant(id) => write!(f, "restaurant:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| format!("malformed channel: {raw}"))?;
        let id: Uuid = id.parse().map_err(|_| format!("bad channel id: {id}"))?;
        match kind {
            "order" => Ok(Channel::Order(id)),
            "courier" => Ok(Channel::Courier(id)),
            "restaurant" => Ok(Channel::Restaurant(id)),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    OrderStatusChanged,
    OrderProposed,
    NewDeliveryAvailable,
    OrderCancelled,
    OrderReady,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::OrderStatusChanged => "order_status_changed",
            EventName::OrderProposed => "order_proposed",
            EventName::NewDeliveryAvailable => "new_delivery_available",
            EventName::OrderCancelled => "order_cancelled",
            EventName::OrderReady => "order_ready",
        }
    }
}

/// What subscribers receive: the channel string, the event name, and the
/// event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub event: EventName,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Publish seam between the engines and the real-time layer. Fire and
/// forget; a publish with no subscribers is not an error.
pub trait Notifier: Send + Sync {
    fn publish(&self, channel: Channel, event: EventName, payload: Value);
}

/// Fan-out over a tokio broadcast channel; the WebSocket bridge subscribes
/// and filters by channel string.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<Envelope>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, channel: Channel, event: EventName, payload: Value) {
        let envelope = Envelope {
            channel: channel.to_string(),
            event,
            payload,
            at: Utc::now(),
        };
        // Err only means no subscriber is listening right now.
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_display() {
        let id = Uuid::from_u128(42);
        for channel in [Channel::Order(id), Channel::Courier(id), Channel::Restaurant(id)] {
            let rendered = channel.to_string();
            assert_eq!(rendered.parse::<Channel>().unwrap(), channel);
        }
    }

    #[test]
    fn channel_rejects_garbage() {
        assert!("orders:123".parse::<Channel>().is_err());
        assert!("order:not-a-uuid".parse::<Channel>().is_err());
        assert!("order".parse::<Channel>().is_err());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let (tx, mut rx) = broadcast::channel(8);
        let notifier = BroadcastNotifier::new(tx);

        let id = Uuid::from_u128(7);
        notifier.publish(
            Channel::Order(id),
            EventName::OrderStatusChanged,
            serde_json::json!({ "status": "accepted" }),
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.channel, format!("order:{id}"));
        assert_eq!(envelope.event, EventName::OrderStatusChanged);
        assert_eq!(envelope.payload["status"], "accepted");
    }
}
