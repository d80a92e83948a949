//! Message identities and decoded message values.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// The key naming one registered message kind.
///
/// Identities are supplied by the caller at registration time and travel on
/// the wire unchanged, so they must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Arc<str>);

impl MessageId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Hash and Eq both delegate to the inner str, so maps keyed by identity can
// be queried with a plain `&str`.
impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Any type that can be registered with a [`Processor`](crate::Processor).
///
/// Blanket-implemented for every serde type that can cross threads.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Type-erased body of a decoded message.
pub type MessageBody = Arc<dyn Any + Send + Sync>;

/// A structured message decoded into its registered type.
#[derive(Clone)]
pub struct TypedMessage {
    id: MessageId,
    body: MessageBody,
}

impl TypedMessage {
    /// Wraps a value under the given identity.
    ///
    /// Routing checks the identity against the registry, so a message built
    /// here for an unknown identity is rejected by `route`.
    pub fn new<T: Message>(id: impl Into<MessageId>, value: T) -> Self {
        Self {
            id: id.into(),
            body: Arc::new(value),
        }
    }

    pub(crate) fn from_body(id: MessageId, body: MessageBody) -> Self {
        Self { id, body }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.body.is::<T>()
    }

    /// The concrete type of the body, not of the `Arc` holding it.
    pub fn body_type_id(&self) -> TypeId {
        (*self.body).type_id()
    }
}

impl fmt::Debug for TypedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMessage")
            .field("id", &self.id)
            .field("body", &"[body]")
            .finish()
    }
}

/// An undecoded body for identities that registered a raw handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub data: Vec<u8>,
}

/// Result of unmarshaling one wire frame.
#[derive(Debug, Clone)]
pub enum Decoded {
    Message(TypedMessage),
    Raw(RawMessage),
}

impl Decoded {
    pub fn id(&self) -> &MessageId {
        match self {
            Decoded::Message(message) => message.id(),
            Decoded::Raw(raw) => &raw.id,
        }
    }

    /// Returns the typed body if this is a structured message of type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Decoded::Message(message) => message.downcast_ref::<T>(),
            Decoded::Raw(_) => None,
        }
    }
}

impl From<TypedMessage> for Decoded {
    fn from(message: TypedMessage) -> Self {
        Decoded::Message(message)
    }
}

impl From<RawMessage> for Decoded {
    fn from(raw: RawMessage) -> Self {
        Decoded::Raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_identity_lookup_by_str() {
        let mut ids = HashMap::new();
        ids.insert(MessageId::new("Login"), 1u16);

        assert_eq!(ids.get("Login"), Some(&1));
        assert!(!ids.contains_key("Logout"));
        assert_eq!(MessageId::from("Login".to_string()), MessageId::new("Login"));
    }
}
