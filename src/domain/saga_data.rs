//! Persisted saga state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the identity property every saga entity exposes
pub const SAGA_ID_PROPERTY: &str = "Id";
const ORIGINATOR_PROPERTY: &str = "Originator";
const ORIGINAL_MESSAGE_ID_PROPERTY: &str = "OriginalMessageId";

/// The data of a single saga instance.
///
/// `entity_type` names the saga data type the instance belongs to; the store
/// only compares correlation values between instances of the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEntity {
    /// Saga instance identity
    pub id: Uuid,

    /// Full name of the saga data type
    pub entity_type: String,

    /// Address of the endpoint that started the saga
    pub originator: Option<String>,

    /// Id of the message that started the saga
    pub original_message_id: Option<String>,

    /// Saga-specific state
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl SagaEntity {
    /// Create an empty entity
    pub fn new(id: Uuid, entity_type: impl Into<String>) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            originator: None,
            original_message_id: None,
            values: Map::new(),
        }
    }

    /// Builder-style setter for a single property
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    /// Read a property. Identity and reply metadata are exposed under their
    /// property names, unknown properties read as null.
    pub fn get(&self, property: &str) -> Value {
        match property {
            SAGA_ID_PROPERTY => Value::String(self.id.to_string()),
            ORIGINATOR_PROPERTY => self.originator.clone().map(Value::String).unwrap_or(Value::Null),
            ORIGINAL_MESSAGE_ID_PROPERTY => self
                .original_message_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            _ => self.values.get(property).cloned().unwrap_or(Value::Null),
        }
    }

    /// Read a property only if the entity carries it. Identity and reply
    /// metadata are always present, bag entries only once set.
    pub fn try_get(&self, property: &str) -> Option<Value> {
        match property {
            SAGA_ID_PROPERTY | ORIGINATOR_PROPERTY | ORIGINAL_MESSAGE_ID_PROPERTY => Some(self.get(property)),
            _ => self.values.get(property).cloned(),
        }
    }

    /// Write a property into the value bag
    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(property.into(), value.into());
    }
}
