//! Offline action model and causal partitioning.
//!
//! A [`QueuedAction`] is one locally-originated mutation waiting to be replayed
//! against the remote API. Every action carries a [`PartitionKey`] derived
//! from the entity it targets; actions sharing a key are delivered strictly in
//! enqueue order, actions with different keys are independent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stockman_core::{ActionId, DomainError, EntityType, Operation};

/// Causal ordering domain of an action: `"<entity>:<target id>"`, or the bare
/// entity name for singletons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(entity_type: EntityType, target_id: Option<&str>) -> Self {
        match target_id {
            Some(target) if !entity_type.is_singleton() => {
                Self(format!("{}:{}", entity_type.as_str(), target))
            }
            _ => Self(entity_type.as_str().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Malformed enqueue request, rejected before the action enters the queue.
///
/// This is a programming-error signal: callers are expected to validate
/// before enqueueing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidActionError {
    #[error("action request is missing its entity type")]
    MissingEntity,
    #[error("action request is missing its operation")]
    MissingOperation,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{operation} on {entity_type} requires a target id")]
    MissingTarget {
        entity_type: EntityType,
        operation: Operation,
    },
    #[error("{operation} on {entity_type} requires an object payload")]
    InvalidPayload {
        entity_type: EntityType,
        operation: Operation,
    },
}

/// A mutation request coming from the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub id: Option<ActionId>,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: Value,
    pub target_id: Option<String>,
}

impl ActionRequest {
    pub fn new(entity_type: EntityType, operation: Operation, payload: Value) -> Self {
        Self {
            id: None,
            entity_type,
            operation,
            payload,
            target_id: None,
        }
    }

    /// Build a request from untyped names (e.g. a bridge to the UI runtime).
    pub fn parse(
        entity_type: Option<&str>,
        operation: Option<&str>,
        payload: Value,
    ) -> Result<Self, InvalidActionError> {
        let entity_type = entity_type
            .filter(|s| !s.trim().is_empty())
            .ok_or(InvalidActionError::MissingEntity)?
            .parse::<EntityType>()?;
        let operation = operation
            .filter(|s| !s.trim().is_empty())
            .ok_or(InvalidActionError::MissingOperation)?
            .parse::<Operation>()?;

        Ok(Self::new(entity_type, operation, payload))
    }

    /// Use a caller-supplied action id (makes repeated enqueues idempotent).
    pub fn with_id(mut self, id: ActionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Address an explicit entity id instead of reading it from the payload.
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Turn the request into a queued action and derive its partition key.
    ///
    /// Pure: no IO, no clock other than the enqueue timestamp.
    pub fn build(self) -> Result<QueuedAction, InvalidActionError> {
        let ActionRequest {
            id,
            entity_type,
            operation,
            payload,
            target_id,
        } = self;

        let needs_object = matches!(operation, Operation::Create | Operation::Update);
        if needs_object && !payload.is_object() {
            return Err(InvalidActionError::InvalidPayload {
                entity_type,
                operation,
            });
        }

        let id = id.unwrap_or_default();
        let target_id = target_id.or_else(|| target_from_payload(entity_type, &payload));

        let target_id = if entity_type.is_singleton() {
            None
        } else {
            match operation {
                // Not yet known to the server: the provisional id orders any
                // follow-up update/delete behind this create.
                Operation::Create => Some(target_id.unwrap_or_else(|| id.to_string())),
                Operation::Update | Operation::Delete => {
                    Some(target_id.ok_or(InvalidActionError::MissingTarget {
                        entity_type,
                        operation,
                    })?)
                }
            }
        };

        Ok(QueuedAction {
            id,
            entity_type,
            operation,
            partition_key: PartitionKey::new(entity_type, target_id.as_deref()),
            target_id,
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
            retry_at: None,
        })
    }
}

/// Read the entity id out of a payload (`<entity>_id`, then `id`).
pub fn target_from_payload(entity_type: EntityType, payload: &Value) -> Option<String> {
    let fields = entity_type.id_field().into_iter().chain(std::iter::once("id"));
    for field in fields {
        match payload.get(field) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// A mutation waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: ActionId,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: Value,
    pub target_id: Option<String>,
    pub partition_key: PartitionKey,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Earliest instant this action may be attempted again (backoff).
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    /// Whether backoff allows an attempt at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }

    /// Whether the payload refers to the `entity_type` entity with id `id`.
    pub fn references(&self, entity_type: EntityType, id: &str) -> bool {
        find_reference(&self.payload, &self.reference_fields(entity_type), id)
    }

    /// Rewrite references to `remap.provisional` into the server id.
    ///
    /// Only id fields of the remapped entity are touched (`customer_id` for a
    /// customer, plus `id` in the customer's own actions). Returns whether
    /// anything changed.
    pub fn apply_remap(&mut self, remap: &IdRemap) -> bool {
        let fields = self.reference_fields(remap.entity_type);
        let mut changed = replace_reference(&mut self.payload, &fields, &remap.provisional, &remap.server);

        if self.entity_type == remap.entity_type
            && self.target_id.as_deref() == Some(remap.provisional.as_str())
        {
            self.target_id = Some(remap.server.clone());
            self.partition_key = PartitionKey::new(self.entity_type, Some(&remap.server));
            changed = true;
        }

        changed
    }

    fn reference_fields(&self, entity_type: EntityType) -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = entity_type.id_field().filter(|f| *f != "id").into_iter().collect();
        if self.entity_type == entity_type {
            fields.push("id");
        }
        fields
    }
}

/// A provisional entity id resolved to the id the server assigned on create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRemap {
    pub entity_type: EntityType,
    pub provisional: String,
    pub server: String,
}

/// Dead-letter record: an action that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    #[serde(flatten)]
    pub action: QueuedAction,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedAction {
    pub fn new(action: QueuedAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ActionId {
        self.action.id
    }
}

/// Group actions by partition key.
///
/// Partitions are returned in order of first appearance and each keeps the
/// relative order of its actions.
pub fn group_by_partition(actions: &[QueuedAction]) -> Vec<(PartitionKey, Vec<&QueuedAction>)> {
    let mut index: HashMap<&PartitionKey, usize> = HashMap::new();
    let mut groups: Vec<(PartitionKey, Vec<&QueuedAction>)> = Vec::new();

    for action in actions {
        match index.get(&action.partition_key) {
            Some(&i) => groups[i].1.push(action),
            None => {
                index.insert(&action.partition_key, groups.len());
                groups.push((action.partition_key.clone(), vec![action]));
            }
        }
    }

    groups
}

/// Head (oldest action) of every partition, in order of first appearance.
pub fn partition_heads(actions: &[QueuedAction]) -> Vec<&QueuedAction> {
    group_by_partition(actions)
        .into_iter()
        .filter_map(|(_, group)| group.into_iter().next())
        .collect()
}

fn is_id(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Number(n) => n.to_string() == id,
        _ => false,
    }
}

/// Search `fields` anywhere in `value` (nested objects and arrays included)
/// for the value `id`.
fn find_reference(value: &Value, fields: &[&str], id: &str) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, v)| (fields.contains(&key.as_str()) && is_id(v, id)) || find_reference(v, fields, id)),
        Value::Array(items) => items.iter().any(|item| find_reference(item, fields, id)),
        _ => false,
    }
}

/// Replace `from` with `to` in every `fields` entry, recursively. A numeric
/// id stays numeric when the server id is numeric too.
fn replace_reference(value: &mut Value, fields: &[&str], from: &str, to: &str) -> bool {
    match value {
        Value::Object(map) => map.iter_mut().fold(false, |changed, (key, v)| {
            if fields.contains(&key.as_str()) && is_id(v, from) {
                *v = match (&*v, to.parse::<u64>()) {
                    (Value::Number(_), Ok(n)) => Value::from(n),
                    _ => Value::String(to.to_string()),
                };
                true
            } else {
                replace_reference(v, fields, from, to) || changed
            }
        }),
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| replace_reference(item, fields, from, to) || changed),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_without_id_uses_action_id_as_provisional_target() {
        let action = ActionRequest::new(EntityType::Customer, Operation::Create, json!({"name": "A"}))
            .build()
            .unwrap();

        let expected = action.id.to_string();
        assert_eq!(action.target_id.as_deref(), Some(expected.as_str()));
        assert_eq!(action.partition_key.as_str(), format!("customer:{expected}"));
        assert_eq!(action.attempts, 0);
    }

    #[test]
    fn update_reads_target_from_entity_id_field() {
        let action = ActionRequest::new(
            EntityType::Product,
            Operation::Update,
            json!({"product_id": "p-1", "price": 10}),
        )
        .build()
        .unwrap();

        assert_eq!(action.partition_key.as_str(), "product:p-1");
    }

    #[test]
    fn delete_falls_back_to_plain_id_field() {
        let action = ActionRequest::new(EntityType::Supplier, Operation::Delete, json!({"id": 42}))
            .build()
            .unwrap();

        assert_eq!(action.target_id.as_deref(), Some("42"));
    }

    #[test]
    fn settings_share_one_partition() {
        let a = ActionRequest::new(EntityType::Settings, Operation::Update, json!({"currency": "XOF"}))
            .build()
            .unwrap();
        let b = ActionRequest::new(EntityType::Settings, Operation::Update, json!({"id": "x"}))
            .build()
            .unwrap();

        assert_eq!(a.partition_key, b.partition_key);
        assert_eq!(a.partition_key.as_str(), "settings");
        assert!(a.target_id.is_none());
    }

    #[test]
    fn update_without_target_is_rejected() {
        let err = ActionRequest::new(EntityType::Customer, Operation::Update, json!({"phone": "123"}))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            InvalidActionError::MissingTarget {
                entity_type: EntityType::Customer,
                operation: Operation::Update,
            }
        );
    }

    #[test]
    fn create_requires_object_payload() {
        let err = ActionRequest::new(EntityType::Sale, Operation::Create, json!([1, 2]))
            .build()
            .unwrap_err();
        assert!(matches!(err, InvalidActionError::InvalidPayload { .. }));
    }

    #[test]
    fn parse_rejects_missing_and_unknown_names() {
        assert_eq!(
            ActionRequest::parse(None, Some("create"), json!({})).unwrap_err(),
            InvalidActionError::MissingEntity
        );
        assert_eq!(
            ActionRequest::parse(Some("sale"), Some(" "), json!({})).unwrap_err(),
            InvalidActionError::MissingOperation
        );
        assert!(matches!(
            ActionRequest::parse(Some("invoice"), Some("create"), json!({})).unwrap_err(),
            InvalidActionError::Domain(DomainError::UnknownEntity(_))
        ));

        let ok = ActionRequest::parse(Some("alert_rule"), Some("create"), json!({})).unwrap();
        assert_eq!(ok.entity_type, EntityType::AlertRule);
    }

    #[test]
    fn remap_rewrites_payload_and_partition() {
        let mut update = ActionRequest::new(
            EntityType::Customer,
            Operation::Update,
            json!({"customer_id": "tmp-1", "phone": "123"}),
        )
        .build()
        .unwrap();
        let mut sale = ActionRequest::new(
            EntityType::Sale,
            Operation::Create,
            json!({"items": [{"qty": 1}], "customer_id": "tmp-1"}),
        )
        .build()
        .unwrap();
        let sale_partition = sale.partition_key.clone();

        let remap = IdRemap {
            entity_type: EntityType::Customer,
            provisional: "tmp-1".to_string(),
            server: "c-900".to_string(),
        };

        assert!(update.apply_remap(&remap));
        assert_eq!(update.partition_key.as_str(), "customer:c-900");
        assert_eq!(update.payload["customer_id"], "c-900");

        assert!(sale.apply_remap(&remap));
        assert_eq!(sale.payload["customer_id"], "c-900");
        assert_eq!(sale.partition_key, sale_partition);
    }

    #[test]
    fn remap_only_touches_id_fields_of_the_remapped_entity() {
        let mut sale = ActionRequest::new(
            EntityType::Sale,
            Operation::Create,
            json!({
                "customer_id": 17,
                "note": "17",
                "product_id": 17,
                "items": [{"customer_id": "17"}],
            }),
        )
        .build()
        .unwrap();

        assert!(sale.references(EntityType::Customer, "17"));
        assert!(!sale.references(EntityType::Supplier, "17"));

        let remap = IdRemap {
            entity_type: EntityType::Customer,
            provisional: "17".to_string(),
            server: "901".to_string(),
        };
        assert!(sale.apply_remap(&remap));

        assert_eq!(sale.payload["customer_id"], json!(901));
        assert_eq!(sale.payload["items"][0]["customer_id"], json!("901"));
        assert_eq!(sale.payload["note"], json!("17"));
        assert_eq!(sale.payload["product_id"], json!(17));
        assert!(!sale.references(EntityType::Customer, "17"));
    }

    #[test]
    fn plain_id_field_is_only_rewritten_for_the_same_entity() {
        let remap = IdRemap {
            entity_type: EntityType::Product,
            provisional: "tmp-9".to_string(),
            server: "p-9".to_string(),
        };

        let mut product = ActionRequest::new(EntityType::Product, Operation::Update, json!({"id": "tmp-9"}))
            .build()
            .unwrap();
        assert!(product.apply_remap(&remap));
        assert_eq!(product.payload["id"], "p-9");
        assert_eq!(product.target_id.as_deref(), Some("p-9"));

        let mut supplier = ActionRequest::new(EntityType::Supplier, Operation::Update, json!({"id": "tmp-9"}))
            .build()
            .unwrap();
        assert!(!supplier.apply_remap(&remap));
        assert_eq!(supplier.payload["id"], "tmp-9");
    }

    #[test]
    fn failed_action_serializes_flat() {
        let action = ActionRequest::new(EntityType::Expense, Operation::Create, json!({"amount": 5}))
            .build()
            .unwrap();
        let failed = FailedAction::new(action.clone(), "rejected");

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["entity_type"], "expense");
        assert_eq!(json["reason"], "rejected");

        let back: FailedAction = serde_json::from_value(json).unwrap();
        assert_eq!(back.action, action);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn action_for(target: u8, seq: usize) -> QueuedAction {
            ActionRequest::new(
                EntityType::Product,
                Operation::Update,
                json!({"product_id": format!("p{target}"), "seq": seq}),
            )
            .build()
            .unwrap()
        }

        proptest! {
            /// Property: grouping keeps every action exactly once, in enqueue order per partition.
            #[test]
            fn grouping_preserves_order_within_partition(targets in proptest::collection::vec(0u8..6, 0..60)) {
                let actions: Vec<_> = targets
                    .iter()
                    .enumerate()
                    .map(|(seq, t)| action_for(*t, seq))
                    .collect();

                let groups = group_by_partition(&actions);

                let total: usize = groups.iter().map(|(_, g)| g.len()).sum();
                prop_assert_eq!(total, actions.len());

                for (key, group) in &groups {
                    let seqs: Vec<u64> = group.iter().map(|a| a.payload["seq"].as_u64().unwrap()).collect();
                    let mut sorted = seqs.clone();
                    sorted.sort_unstable();
                    prop_assert_eq!(seqs, sorted);
                    prop_assert!(group.iter().all(|a| &a.partition_key == key));
                }

                let keys: std::collections::HashSet<_> = groups.iter().map(|(k, _)| k.clone()).collect();
                prop_assert_eq!(keys.len(), groups.len());
            }
        }
    }
}
