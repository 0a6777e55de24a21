//! Event envelope carried on every queue and topic.
//!
//! Wire format is a flat JSON object: `eventType` discriminates the variant,
//! `timestamp` is ISO-8601 and the remaining fields belong to the variant:
//!
//! ```json
//! {"eventType":"CHECKOUT_COMPLETED","timestamp":"2024-05-01T12:00:00.000Z",
//!  "listId":"1","userId":"user123", ... ,"totalAmount":45.5,"itemCount":3}
//! ```
//!
//! Task sync messages produced by the mobile app carry no `eventType`; they are
//! recognised by their `operation` field and decoded as [`DomainEvent::TaskSync`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{BusError, Result};

const EVENT_TYPE_FIELD: &str = "eventType";
const TASK_OPERATION_FIELD: &str = "operation";
const TASK_SYNC_EVENT_TYPE: &str = "TASK_SYNC";

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// Event payload, discriminated by `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    CheckoutCompleted(CheckoutCompleted),
    ItemCreated(ItemNotification),
    ItemUpdated(ItemNotification),
    TaskSync(TaskSync),
    /// Any `eventType` this build does not know. Handlers log and skip it.
    #[serde(other)]
    Unknown,
}

/// A shopping list was checked out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutCompleted {
    pub list_id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub list_name: String,
    #[serde(default)]
    pub items: Vec<String>,
    pub total_amount: f64,
    pub item_count: u32,
}

/// Inventory item as published by the items service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub purchased: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_quantity() -> u32 {
    1
}

/// Item created or updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemNotification {
    pub item: Item,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_item: Option<Item>,
}

/// Operation requested by the mobile task app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOperation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

impl TaskOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOperation::Create => "create",
            TaskOperation::Update => "update",
            TaskOperation::Delete => "delete",
            TaskOperation::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub synced: bool,
}

/// Task change synced from the mobile app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSync {
    pub operation: TaskOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub task: Task,
}

impl DomainEvent {
    /// Wire name of the variant.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::CheckoutCompleted(_) => "CHECKOUT_COMPLETED",
            DomainEvent::ItemCreated(_) => "ITEM_CREATED",
            DomainEvent::ItemUpdated(_) => "ITEM_UPDATED",
            DomainEvent::TaskSync(_) => TASK_SYNC_EVENT_TYPE,
            DomainEvent::Unknown => "UNKNOWN",
        }
    }

    /// Routing key the event is conventionally published under.
    pub fn routing_key(&self) -> String {
        match self {
            DomainEvent::CheckoutCompleted(_) => "list.checkout.completed".to_string(),
            DomainEvent::ItemCreated(_) => "item.created".to_string(),
            DomainEvent::ItemUpdated(_) => "item.updated".to_string(),
            DomainEvent::TaskSync(sync) => format!("task.{}", sync.operation.as_str()),
            DomainEvent::Unknown => "unknown".to_string(),
        }
    }
}

impl Envelope {
    pub fn new(timestamp: DateTime<Utc>, event: DomainEvent) -> Self {
        Self { timestamp, event }
    }

    /// Wrap an event stamped with the current time.
    pub fn now(event: DomainEvent) -> Self {
        Self::new(Utc::now(), event)
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Serialize to the JSON wire format.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::Decode(e.to_string()))
    }

    /// Decode and validate an envelope from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| BusError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode and validate an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| BusError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(mut value: Value) -> Result<Self> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| BusError::Decode("envelope is not a JSON object".to_string()))?;

        if !object.contains_key(EVENT_TYPE_FIELD) && object.contains_key(TASK_OPERATION_FIELD) {
            object.insert(
                EVENT_TYPE_FIELD.to_string(),
                Value::String(TASK_SYNC_EVENT_TYPE.to_string()),
            );
        }

        let raw_type = object
            .get(EVENT_TYPE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);

        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| BusError::Decode(e.to_string()))?;

        if envelope.event == DomainEvent::Unknown {
            debug!(event_type = ?raw_type, "Decoded envelope with unknown event type");
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout_json() -> &'static str {
        r#"{
            "eventType": "CHECKOUT_COMPLETED",
            "timestamp": "2024-05-01T12:00:00.000Z",
            "listId": "1",
            "userId": "user123",
            "userEmail": "joao@email.com",
            "userName": "João Silva",
            "listName": "Compras Semanais",
            "items": ["Arroz", "Feijão", "Macarrão"],
            "totalAmount": 45.50,
            "itemCount": 3
        }"#
    }

    #[test]
    fn test_decode_checkout_completed() {
        let envelope = Envelope::from_json(checkout_json()).unwrap();
        match &envelope.event {
            DomainEvent::CheckoutCompleted(checkout) => {
                assert_eq!(checkout.list_id, "1");
                assert_eq!(checkout.item_count, 3);
                assert!((checkout.total_amount - 45.5).abs() < f64::EPSILON);
                assert_eq!(checkout.items.len(), 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(envelope.event_type(), "CHECKOUT_COMPLETED");
    }

    #[test]
    fn test_wire_format_is_flat() {
        let envelope = Envelope::from_json(checkout_json()).unwrap();
        let value: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(value["eventType"], "CHECKOUT_COMPLETED");
        assert_eq!(value["listId"], "1");
        assert_eq!(value["itemCount"], 3);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_task_message_without_event_type() {
        let json = r#"{
            "timestamp": "2024-05-01T12:00:00Z",
            "operation": "CREATE",
            "source": "flutter-app",
            "task": {"id": "t-1", "title": "Buy milk", "completed": false, "synced": true}
        }"#;
        let envelope = Envelope::from_json(json).unwrap();
        match envelope.event {
            DomainEvent::TaskSync(ref sync) => {
                assert_eq!(sync.operation, TaskOperation::Create);
                assert_eq!(sync.task.title, "Buy milk");
                assert!(sync.task.description.is_none());
            }
            ref other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(envelope.event.routing_key(), "task.create");
    }

    #[test]
    fn test_unknown_event_type_decodes() {
        let json = r#"{"eventType":"LIST_ARCHIVED","timestamp":"2024-05-01T12:00:00Z","listId":"9"}"#;
        let envelope = Envelope::from_json(json).unwrap();
        assert_eq!(envelope.event, DomainEvent::Unknown);
    }

    #[test]
    fn test_unknown_task_operation() {
        let json = r#"{"timestamp":"2024-05-01T12:00:00Z","operation":"ARCHIVE","task":{"id":"t","title":"x"}}"#;
        let envelope = Envelope::from_json(json).unwrap();
        match envelope.event {
            DomainEvent::TaskSync(sync) => assert_eq!(sync.operation, TaskOperation::Other),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            Envelope::from_json("[1,2,3]"),
            Err(BusError::Decode(_))
        ));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let json = r#"{"eventType":"CHECKOUT_COMPLETED","timestamp":"2024-05-01T12:00:00Z","listId":"1"}"#;
        assert!(matches!(Envelope::from_json(json), Err(BusError::Decode(_))));
    }

    #[test]
    fn test_rejects_invalid_json() {
        assert!(matches!(
            Envelope::from_slice(b"not json"),
            Err(BusError::Decode(_))
        ));
    }

    #[test]
    fn test_item_defaults() {
        let json = r#"{"eventType":"ITEM_CREATED","timestamp":"2024-05-01T12:00:00Z","item":{"id":"a","name":"Leite"}}"#;
        let envelope = Envelope::from_json(json).unwrap();
        match envelope.event {
            DomainEvent::ItemCreated(notification) => {
                assert_eq!(notification.item.quantity, 1);
                assert!(!notification.item.purchased);
                assert!(notification.previous_item.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_routing_keys() {
        let envelope = Envelope::from_json(checkout_json()).unwrap();
        assert_eq!(envelope.event.routing_key(), "list.checkout.completed");
    }
}
