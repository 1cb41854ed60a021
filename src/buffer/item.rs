use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event name carried by items the controller synthesizes when a drain
/// callback fails. Downstream consumers observe delivery failures through
/// the same pipeline as any other event.
pub const DELIVERY_FAILURE_NAME: &str = "agent.net.error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Metric,
    Event,
}

impl ItemKind {
    /// Events outrank metrics unless the caller assigns an explicit weight.
    pub fn default_priority(self) -> Priority {
        match self {
            ItemKind::Metric => Priority::METRIC,
            ItemKind::Event => Priority::EVENT,
        }
    }
}

/// Removal priority of a buffered item. Higher weights drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Priority(u8);

impl Priority {
    pub const METRIC: Priority = Priority(100);
    pub const EVENT: Priority = Priority(200);

    pub const fn new(weight: u8) -> Self {
        Priority(weight)
    }

    pub const fn weight(self) -> u8 {
        self.0
    }
}

/// One telemetry sample. The payload is opaque to the buffer; immutable
/// once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    kind: ItemKind,
    priority: Priority,
    payload: Bytes,
    created_at: DateTime<Utc>,
}

impl Item {
    pub fn metric(payload: impl Into<Bytes>) -> Self {
        Self::with_priority(ItemKind::Metric, payload, ItemKind::Metric.default_priority())
    }

    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self::with_priority(ItemKind::Event, payload, ItemKind::Event.default_priority())
    }

    pub fn with_priority(kind: ItemKind, payload: impl Into<Bytes>, priority: Priority) -> Self {
        Self {
            kind,
            priority,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Builds the self-describing event recording a delivery failure. The
    /// controller reinserts it alongside the requeued batch so failures are
    /// themselves observable telemetry.
    pub fn delivery_failure(error: &(dyn std::error::Error + Send + Sync)) -> Self {
        #[derive(Serialize)]
        struct FailureBody {
            name: &'static str,
            error: String,
            occurred_at: DateTime<Utc>,
        }

        let body = FailureBody {
            name: DELIVERY_FAILURE_NAME,
            error: error.to_string(),
            occurred_at: Utc::now(),
        };

        let payload = serde_json::to_vec(&body)
            .unwrap_or_else(|_| format!("{{\"name\":\"{DELIVERY_FAILURE_NAME}\"}}").into_bytes());

        Self::event(payload)
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Ordered group of items removed together from the buffer. Order is the
/// removal order (priority, then insertion), not arrival order across
/// distinct priority classes.
pub type ItemBatch = Vec<Item>;
