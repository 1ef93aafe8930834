//! Notification bus adapter (C9).
//!
//! A narrow property/function registry, structurally typed by the channels
//! in use rather than by interface inheritance — see the design note on
//! "observer lists on mixed channels". Backed by a [`DashMap`] for
//! read-after-write property storage and a [`tokio::sync::broadcast`]
//! channel for change notification, the same pairing this workspace uses
//! for `LayerInner::status`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

pub type PropertyValidator = Arc<dyn Fn(&PropertyValue) -> bool + Send + Sync>;
pub type FunctionHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyChanged {
    pub name: String,
    pub value: PropertyValue,
}

struct PropertySlot {
    value: PropertyValue,
    validator: Option<PropertyValidator>,
}

/// Process-wide notification bus. One instance is shared (via `Arc`) by the
/// Asset Manager and every Requester it owns.
pub struct NotificationBus {
    properties: DashMap<String, PropertySlot>,
    functions: DashMap<String, FunctionHandler>,
    changes: broadcast::Sender<PropertyChanged>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(1024);
        Self {
            properties: DashMap::new(),
            functions: DashMap::new(),
            changes,
        }
    }

    pub fn register_property(
        &self,
        name: impl Into<String>,
        initial: PropertyValue,
        validator: Option<PropertyValidator>,
    ) {
        self.properties.insert(
            name.into(),
            PropertySlot {
                value: initial,
                validator,
            },
        );
    }

    pub fn deregister_property(&self, name: &str) {
        self.properties.remove(name);
    }

    pub fn read_property(&self, name: &str) -> Option<PropertyValue> {
        self.properties.get(name).map(|slot| slot.value.clone())
    }

    /// Write a property. Returns `false` if the property is unknown or the
    /// registered validator rejects the value; the previous value is kept
    /// in that case. Subscribers observe the write only after it commits.
    pub fn write_property(&self, name: &str, value: PropertyValue) -> bool {
        let Some(mut slot) = self.properties.get_mut(name) else {
            return false;
        };
        if let Some(validator) = &slot.validator {
            if !validator(&value) {
                return false;
            }
        }
        slot.value = value.clone();
        drop(slot);
        // Dropped receivers (no subscribers yet) are not an error here.
        let _ = self.changes.send(PropertyChanged {
            name: name.to_string(),
            value,
        });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropertyChanged> {
        self.changes.subscribe()
    }

    pub fn register_function(&self, name: impl Into<String>, handler: FunctionHandler) {
        self.functions.insert(name.into(), handler);
    }

    pub fn deregister_function(&self, name: &str) {
        self.functions.remove(name);
    }

    pub fn invoke(&self, name: &str, arg: &str) -> Option<bool> {
        self.functions.get(name).map(|handler| handler(arg))
    }

    /// True if any property with this prefix is still registered, used by
    /// the "no property prefixed by `S_` is readable after delete" invariant.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.properties.iter().any(|e| e.key().starts_with(prefix))
    }
}

pub mod suffix {
    pub const STATE: &str = "_State";
    pub const PRIORITY: &str = "_Priority";
    pub const PATH: &str = "_Path";
    pub const UPDATE: &str = "_Update";
}

pub const INITIALIZATION_PROPERTY: &str = "Initialization";
pub const REGISTER_ARTIFACT_FUNCTION: &str = "RegisterArtifact";
pub const REMOVE_ARTIFACT_FUNCTION: &str = "RemoveArtifact";
pub const ACCEPT_UPDATE_FUNCTION: &str = "AcceptUpdate";
pub const REJECT_UPDATE_FUNCTION: &str = "RejectUpdate";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rejects_invalid_value_and_keeps_previous() {
        let bus = NotificationBus::new();
        let validator: PropertyValidator = Arc::new(|v| matches!(v, PropertyValue::Int(0..=3)));
        bus.register_property("x_Priority", PropertyValue::Int(0), Some(validator));
        assert!(bus.write_property("x_Priority", PropertyValue::Int(2)));
        assert!(!bus.write_property("x_Priority", PropertyValue::Int(99)));
        assert_eq!(bus.read_property("x_Priority"), Some(PropertyValue::Int(2)));
    }

    #[test]
    fn deregister_clears_prefix() {
        let bus = NotificationBus::new();
        bus.register_property("x_State", PropertyValue::Int(0), None);
        assert!(bus.has_prefix("x_"));
        bus.deregister_property("x_State");
        assert!(!bus.has_prefix("x_"));
    }
}
