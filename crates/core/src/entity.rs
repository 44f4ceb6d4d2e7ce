//! Syncable entity types and mutation operations.
//!
//! Both sets are closed: an offline action can only target one of the
//! entities the back-office API exposes for mutation.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kind of record an offline action mutates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Sale,
    Order,
    Stock,
    Customer,
    Expense,
    Supplier,
    AlertRule,
    Settings,
    Notification,
}

impl EntityType {
    pub const ALL: [EntityType; 10] = [
        EntityType::Product,
        EntityType::Sale,
        EntityType::Order,
        EntityType::Stock,
        EntityType::Customer,
        EntityType::Expense,
        EntityType::Supplier,
        EntityType::AlertRule,
        EntityType::Settings,
        EntityType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Sale => "sale",
            EntityType::Order => "order",
            EntityType::Stock => "stock",
            EntityType::Customer => "customer",
            EntityType::Expense => "expense",
            EntityType::Supplier => "supplier",
            EntityType::AlertRule => "alert_rule",
            EntityType::Settings => "settings",
            EntityType::Notification => "notification",
        }
    }

    /// Payload field carrying the entity's identifier.
    ///
    /// Every entity also accepts a plain `id` field as a fallback. Returns
    /// `None` for singletons.
    pub fn id_field(&self) -> Option<&'static str> {
        match self {
            EntityType::Product => Some("product_id"),
            EntityType::Sale => Some("sale_id"),
            EntityType::Order => Some("order_id"),
            EntityType::Stock => Some("movement_id"),
            EntityType::Customer => Some("customer_id"),
            EntityType::Expense => Some("expense_id"),
            EntityType::Supplier => Some("supplier_id"),
            EntityType::AlertRule => Some("rule_id"),
            EntityType::Settings => None,
            EntityType::Notification => Some("id"),
        }
    }

    /// There is exactly one record of this type per shop.
    pub fn is_singleton(&self) -> bool {
        matches!(self, EntityType::Settings)
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| DomainError::UnknownEntity(s.to_string()))
    }
}

/// Mutation performed by an offline action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(DomainError::UnknownOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_names_match_wire_format() {
        for entity in EntityType::ALL {
            let json = serde_json::to_value(entity).unwrap();
            assert_eq!(json, serde_json::Value::String(entity.as_str().to_string()));
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
    }

    #[test]
    fn unknown_entity_is_rejected() {
        assert_eq!(
            "invoice".parse::<EntityType>(),
            Err(DomainError::UnknownEntity("invoice".to_string()))
        );
    }

    #[test]
    fn only_settings_is_a_singleton() {
        let singletons: Vec<_> = EntityType::ALL.into_iter().filter(|e| e.is_singleton()).collect();
        assert_eq!(singletons, vec![EntityType::Settings]);
        assert!(EntityType::Settings.id_field().is_none());
        assert_eq!(EntityType::AlertRule.id_field(), Some("rule_id"));
    }

    #[test]
    fn operations_parse() {
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!(matches!(
            "upsert".parse::<Operation>(),
            Err(DomainError::UnknownOperation(_))
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: parsing accepts exactly the wire names.
            #[test]
            fn entity_parse_accepts_only_known_names(name in "[a-z_]{0,16}") {
                let known = EntityType::ALL.iter().any(|e| e.as_str() == name);
                prop_assert_eq!(name.parse::<EntityType>().is_ok(), known);
            }
        }
    }
}
