//! Message registry, codec and dispatch.
//!
//! The [`Processor`] owns the mapping from a [`MessageId`] to its registered
//! Rust type, its direct handler, its fan-out [`Router`] and its raw handler.
//! It is built once during startup, shared behind an `Arc` with every session,
//! and sealed as soon as the first message is routed.
//!
//! # Wire format
//!
//! Without an [`RpcHandler`] installed, each frame is a JSON object with
//! exactly one key, the message identity, whose value is the base64 encoding
//! of the bincode serialized body:
//!
//! ```json
//! {"Ping":"AQAAAAAAAAA="}
//! ```
//!
//! Installing an `RpcHandler` replaces the envelope and/or the dispatch policy
//! while keeping the registry, so Agent and Server code stay unchanged.
//!
//! # Dispatch order
//!
//! For one routed message at most one of the two paths runs:
//!
//! 1. the raw handler, when the identity has one
//! 2. otherwise the direct handler (inline), then the router (queued)

use crate::config::ByteOrder;
use crate::error::{CodecError, RegistryError, RouteError};
use crate::message::{Decoded, Message, MessageBody, MessageId, RawMessage, TypedMessage};
use crate::router::Router;
use crate::rpc::RpcHandler;
use crate::session::SessionRef;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Handler invoked inline for a structured message.
pub type MessageHandler = Arc<dyn Fn(&TypedMessage, &SessionRef) + Send + Sync>;

/// Handler invoked with the undecoded body.
pub type RawHandler = Arc<dyn Fn(&RawMessage, &SessionRef) + Send + Sync>;

type DecodeFn = fn(&[u8]) -> bincode::Result<MessageBody>;
type EncodeFn = fn(&dyn Any) -> Option<bincode::Result<Vec<u8>>>;
type AcceptsFn = fn(&TypedMessage) -> bool;

fn decode_as<T: Message>(data: &[u8]) -> bincode::Result<MessageBody> {
    let value: T = bincode::deserialize(data)?;
    Ok(Arc::new(value))
}

fn encode_as<T: Message>(value: &dyn Any) -> Option<bincode::Result<Vec<u8>>> {
    value.downcast_ref::<T>().map(|value| bincode::serialize(value))
}

fn accepts<T: Message>(message: &TypedMessage) -> bool {
    message.is::<T>()
}

struct MessageInfo {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
    accepts: AcceptsFn,
    handler: Option<MessageHandler>,
    router: Option<Router>,
    raw_handler: Option<RawHandler>,
}

#[derive(Default)]
struct Registry {
    messages: HashMap<MessageId, MessageInfo>,
    types: HashMap<TypeId, MessageId>,
}

impl Registry {
    fn info_mut(&mut self, id: &MessageId) -> Result<&mut MessageInfo, RegistryError> {
        self.messages
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotRegistered(id.clone()))
    }
}

/// Everything `dispatch` needs, copied out so no lock is held while handlers run.
struct DispatchTarget {
    accepts: AcceptsFn,
    handler: Option<MessageHandler>,
    router: Option<Router>,
    raw_handler: Option<RawHandler>,
}

/// Registry of message kinds plus their codec and dispatch behavior.
///
/// All setup methods take `&self` and fail with [`RegistryError::Sealed`] once
/// the processor is sealed, so a processor shared behind an `Arc` cannot be
/// reconfigured while traffic flows.
pub struct Processor {
    registry: RwLock<Registry>,
    rpc_handler: RwLock<Option<Arc<dyn RpcHandler>>>,
    little_endian: AtomicBool,
    sealed: AtomicBool,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("messages", &self.len())
            .field("byte_order", &self.byte_order())
            .field("sealed", &self.is_sealed())
            .field("rpc_handler", &self.rpc_handler.read().is_some())
            .finish()
    }
}

impl Processor {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            rpc_handler: RwLock::new(None),
            little_endian: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
        }
    }

    fn ensure_unsealed(&self, action: impl FnOnce() -> String) -> Result<(), RegistryError> {
        if self.is_sealed() {
            Err(RegistryError::Sealed(action()))
        } else {
            Ok(())
        }
    }

    /// Binds `T` to the identity `id`.
    ///
    /// # Arguments
    ///
    /// * `id` - Wire identity of the message, must be non-empty and unused
    ///
    /// # Returns
    ///
    /// The registered identity, or a [`RegistryError`] if the identity is
    /// empty, either the identity or the type is already registered, or the
    /// processor is sealed.
    pub fn register<T: Message>(&self, id: impl Into<MessageId>) -> Result<MessageId, RegistryError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::EmptyIdentity);
        }

        let mut registry = self.registry.write();
        self.ensure_unsealed(|| format!("register message {id}"))?;

        if registry.messages.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if let Some(existing) = registry.types.get(&TypeId::of::<T>()) {
            return Err(RegistryError::TypeAlreadyRegistered {
                type_name: type_name::<T>(),
                existing: existing.clone(),
            });
        }

        registry.messages.insert(
            id.clone(),
            MessageInfo {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                decode: decode_as::<T>,
                encode: encode_as::<T>,
                accepts: accepts::<T>,
                handler: None,
                router: None,
                raw_handler: None,
            },
        );
        registry.types.insert(TypeId::of::<T>(), id.clone());
        debug!("registered message {} as {}", id, type_name::<T>());
        Ok(id)
    }

    /// Attaches the handler run inline when a `T` is routed.
    pub fn set_handler<T, F>(&self, id: impl Into<MessageId>, handler: F) -> Result<(), RegistryError>
    where
        T: Message,
        F: Fn(&T, &SessionRef) + Send + Sync + 'static,
    {
        let id = id.into();
        let mut registry = self.registry.write();
        self.ensure_unsealed(|| format!("set handler for {id}"))?;

        let info = registry.info_mut(&id)?;
        if info.type_id != TypeId::of::<T>() {
            return Err(RegistryError::TypeMismatch {
                id,
                registered: info.type_name,
                requested: type_name::<T>(),
            });
        }

        let handler: MessageHandler = Arc::new(move |message: &TypedMessage, session: &SessionRef| {
            if let Some(value) = message.downcast_ref::<T>() {
                handler(value, session);
            }
        });
        info.handler = Some(handler);
        Ok(())
    }

    /// Attaches the fan-out router that receives every routed message of `id`.
    pub fn set_router(&self, id: impl Into<MessageId>, router: Router) -> Result<(), RegistryError> {
        let id = id.into();
        let mut registry = self.registry.write();
        self.ensure_unsealed(|| format!("set router for {id}"))?;
        registry.info_mut(&id)?.router = Some(router);
        Ok(())
    }

    /// Attaches a raw handler. Messages of `id` are then never decoded.
    pub fn set_raw_handler<F>(&self, id: impl Into<MessageId>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&RawMessage, &SessionRef) + Send + Sync + 'static,
    {
        let id = id.into();
        let mut registry = self.registry.write();
        self.ensure_unsealed(|| format!("set raw handler for {id}"))?;
        let handler: RawHandler = Arc::new(handler);
        registry.info_mut(&id)?.raw_handler = Some(handler);
        Ok(())
    }

    /// Installs a strategy that takes over marshal, unmarshal and route.
    pub fn set_rpc_handler(&self, handler: Arc<dyn RpcHandler>) -> Result<(), RegistryError> {
        self.ensure_unsealed(|| "install rpc handler".to_string())?;
        *self.rpc_handler.write() = Some(handler);
        Ok(())
    }

    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_little_endian(self.little_endian.load(Ordering::Acquire))
    }

    /// Sets the byte order read by numeric encodings.
    ///
    /// Setup only: once sealed, only a no-op change is accepted.
    pub fn set_byte_order(&self, order: ByteOrder) -> Result<(), RegistryError> {
        if order != self.byte_order() {
            self.ensure_unsealed(|| "change byte order".to_string())?;
        }
        self.little_endian
            .store(order.is_little_endian(), Ordering::Release);
        Ok(())
    }

    /// Forbids any further setup call.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            debug!("processor sealed with {} messages", self.len());
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.read().messages.contains_key(id)
    }

    /// The stored identity for `id`, shared with the registry.
    fn registered_id(&self, id: &str) -> Option<MessageId> {
        self.registry
            .read()
            .messages
            .get_key_value(id)
            .map(|(id, _)| id.clone())
    }

    /// Identity registered for `T`, if any.
    pub fn id_of<T: 'static>(&self) -> Option<MessageId> {
        self.registry.read().types.get(&TypeId::of::<T>()).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rpc_handler(&self) -> Option<Arc<dyn RpcHandler>> {
        self.rpc_handler.read().clone()
    }

    /// Encodes a registered message into wire frames.
    ///
    /// `msg` may be a value of a registered type, a [`TypedMessage`], or a
    /// [`RawMessage`] whose bytes are forwarded unchanged.
    pub fn marshal(&self, msg: &dyn Any) -> Result<Vec<Vec<u8>>, CodecError> {
        if let Some(handler) = self.rpc_handler() {
            return handler.marshal(self, msg);
        }

        let (id, body) = self.encode_body(msg)?;
        let mut envelope = BTreeMap::new();
        envelope.insert(id.as_str(), BASE64.encode(body));
        let frame = serde_json::to_vec(&envelope)
            .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
        Ok(vec![frame])
    }

    /// Decodes one wire frame.
    pub fn unmarshal(&self, data: &[u8]) -> Result<Decoded, CodecError> {
        if let Some(handler) = self.rpc_handler() {
            return handler.unmarshal(self, data);
        }

        let envelope: BTreeMap<String, String> = serde_json::from_slice(data)
            .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
        if envelope.len() != 1 {
            return Err(CodecError::InvalidArity(envelope.len()));
        }

        let (name, body) = envelope
            .into_iter()
            .next()
            .ok_or(CodecError::InvalidArity(0))?;
        let Some(id) = self.registered_id(&name) else {
            return Err(CodecError::UnknownMessage(MessageId::from(name)));
        };
        let body = BASE64
            .decode(body.as_bytes())
            .map_err(|e| CodecError::MalformedEnvelope(format!("message {id} body: {e}")))?;
        self.decode_body(&id, &body)
    }

    /// Routes a decoded message to its handlers.
    ///
    /// Seals the processor. Safe to call from many sessions at once.
    pub fn route(&self, msg: Decoded, session: &SessionRef) -> Result<(), RouteError> {
        self.seal();
        if let Some(handler) = self.rpc_handler() {
            return handler.route(self, msg, session);
        }
        self.dispatch(msg, session)
    }

    /// Encodes only the body of `msg`, returning it with its identity.
    pub fn encode_body(&self, msg: &dyn Any) -> Result<(MessageId, Vec<u8>), CodecError> {
        if let Some(raw) = msg.downcast_ref::<RawMessage>() {
            if !self.is_registered(raw.id.as_str()) {
                return Err(CodecError::UnknownMessage(raw.id.clone()));
            }
            return Ok((raw.id.clone(), raw.data.clone()));
        }

        let registry = self.registry.read();
        let (id, value): (MessageId, &dyn Any) = match msg.downcast_ref::<TypedMessage>() {
            Some(typed) => {
                let body: &dyn Any = &**typed.body();
                (typed.id().clone(), body)
            }
            None => {
                let id = registry
                    .types
                    .get(&msg.type_id())
                    .ok_or(CodecError::UnregisteredType)?;
                (id.clone(), msg)
            }
        };

        let info = registry
            .messages
            .get(&id)
            .ok_or_else(|| CodecError::UnknownMessage(id.clone()))?;
        match (info.encode)(value) {
            Some(Ok(body)) => Ok((id, body)),
            Some(Err(source)) => Err(CodecError::Payload { id, source }),
            None => Err(CodecError::TypeMismatch(id)),
        }
    }

    /// Decodes a body registered under `id`.
    ///
    /// Identities with a raw handler yield [`Decoded::Raw`] without decoding.
    pub fn decode_body(&self, id: &MessageId, data: &[u8]) -> Result<Decoded, CodecError> {
        let registry = self.registry.read();
        let info = registry
            .messages
            .get(id)
            .ok_or_else(|| CodecError::UnknownMessage(id.clone()))?;

        if info.raw_handler.is_some() {
            return Ok(Decoded::Raw(RawMessage {
                id: id.clone(),
                data: data.to_vec(),
            }));
        }

        let body = (info.decode)(data).map_err(|source| CodecError::Payload {
            id: id.clone(),
            source,
        })?;
        Ok(Decoded::Message(TypedMessage::from_body(id.clone(), body)))
    }

    /// Built-in dispatch, bypassing any installed [`RpcHandler`].
    pub fn dispatch(&self, msg: Decoded, session: &SessionRef) -> Result<(), RouteError> {
        let target = {
            let registry = self.registry.read();
            let info = registry
                .messages
                .get(msg.id())
                .ok_or_else(|| RouteError::UnknownMessage(msg.id().clone()))?;
            DispatchTarget {
                accepts: info.accepts,
                handler: info.handler.clone(),
                router: info.router.clone(),
                raw_handler: info.raw_handler.clone(),
            }
        };

        match msg {
            Decoded::Raw(raw) => match target.raw_handler {
                Some(raw_handler) => {
                    raw_handler(&raw, session);
                    Ok(())
                }
                None => Err(RouteError::NoHandler(raw.id)),
            },
            Decoded::Message(message) => {
                if !(target.accepts)(&message) {
                    return Err(RouteError::TypeMismatch(message.id().clone()));
                }

                if let Some(raw_handler) = target.raw_handler {
                    let (id, data) = self.encode_body(&message)?;
                    raw_handler(&RawMessage { id, data }, session);
                    return Ok(());
                }

                if target.handler.is_none() && target.router.is_none() {
                    return Err(RouteError::NoHandler(message.id().clone()));
                }
                if let Some(handler) = target.handler {
                    handler(&message, session);
                }
                if let Some(router) = target.router {
                    router.go(message, session.clone());
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::StubSession;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    fn session(label: &'static str) -> SessionRef {
        StubSession::with_data(Arc::new(label))
    }

    fn label(session: &SessionRef) -> &'static str {
        session
            .user_data()
            .and_then(|data| data.downcast_ref::<&'static str>().copied())
            .unwrap_or("")
    }

    #[test]
    fn test_round_trip() {
        let processor = Processor::new();
        processor.register::<Ping>("Ping").unwrap();
        processor.register::<Pong>("Pong").unwrap();

        let ping = Ping {
            seq: 42,
            note: "hello".to_string(),
        };
        let frames = processor.marshal(&ping).unwrap();
        assert_eq!(frames.len(), 1);

        let decoded = processor.unmarshal(&frames[0]).unwrap();
        assert_eq!(decoded.id().as_str(), "Ping");
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&ping));

        let pong = Pong { seq: 7 };
        let decoded = processor
            .unmarshal(&processor.marshal(&pong).unwrap()[0])
            .unwrap();
        assert_eq!(decoded.downcast_ref::<Pong>(), Some(&pong));
    }

    #[test]
    fn test_envelope_shape() {
        let processor = Processor::new();
        processor.register::<Pong>("Pong").unwrap();

        let frame = &processor.marshal(&Pong { seq: 1 }).unwrap()[0];
        let json: serde_json::Value = serde_json::from_slice(frame).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 1);

        let body = BASE64.decode(object["Pong"].as_str().unwrap()).unwrap();
        assert_eq!(body, bincode::serialize(&Pong { seq: 1 }).unwrap());
    }

    #[test]
    fn test_unmarshal_errors() {
        let processor = Processor::new();
        processor.register::<Pong>("Pong").unwrap();

        match processor.unmarshal(br#"{"Unknown":"AA=="}"#) {
            Err(CodecError::UnknownMessage(id)) => assert_eq!(id.as_str(), "Unknown"),
            other => panic!("expected unknown message, got {other:?}"),
        }
        assert!(matches!(
            processor.unmarshal(br#"{}"#),
            Err(CodecError::InvalidArity(0))
        ));
        assert!(matches!(
            processor.unmarshal(br#"{"Pong":"AA==","Ping":"AA=="}"#),
            Err(CodecError::InvalidArity(2))
        ));
        assert!(matches!(
            processor.unmarshal(b"not json"),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            processor.unmarshal(br#"{"Pong":"AA=="}"#),
            Err(CodecError::Payload { .. })
        ));
    }

    #[test]
    fn test_marshal_unregistered_type() {
        let processor = Processor::new();
        assert!(matches!(
            processor.marshal(&Pong { seq: 1 }),
            Err(CodecError::UnregisteredType)
        ));
    }

    #[test]
    fn test_registration_errors() {
        let processor = Processor::new();
        assert!(matches!(
            processor.register::<Ping>(""),
            Err(RegistryError::EmptyIdentity)
        ));
        processor.register::<Ping>("Ping").unwrap();
        assert!(matches!(
            processor.register::<Pong>("Ping"),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            processor.register::<Ping>("Ping2"),
            Err(RegistryError::TypeAlreadyRegistered { .. })
        ));
        assert!(matches!(
            processor.set_handler::<Ping, _>("Missing", |_, _| {}),
            Err(RegistryError::NotRegistered(_))
        ));
        assert!(matches!(
            processor.set_handler::<Pong, _>("Ping", |_, _| {}),
            Err(RegistryError::TypeMismatch { .. })
        ));
        assert_eq!(processor.len(), 1);
        assert_eq!(processor.id_of::<Ping>().unwrap().as_str(), "Ping");
    }

    #[test]
    fn test_route_seals_registry() {
        let processor = Processor::new();
        processor.register::<Ping>("Ping").unwrap();
        processor.set_handler::<Ping, _>("Ping", |_, _| {}).unwrap();

        let msg = TypedMessage::new(
            "Ping",
            Ping {
                seq: 1,
                note: String::new(),
            },
        );
        processor.route(msg.into(), &session("a")).unwrap();

        assert!(processor.is_sealed());
        assert!(matches!(
            processor.register::<Pong>("Pong"),
            Err(RegistryError::Sealed(_))
        ));
        assert!(matches!(
            processor.set_byte_order(ByteOrder::LittleEndian),
            Err(RegistryError::Sealed(_))
        ));
        assert!(processor.set_byte_order(ByteOrder::BigEndian).is_ok());
    }

    #[test]
    fn test_handler_then_router_order() {
        let processor = Processor::new();
        processor.register::<Ping>("Ping").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let handler_events = events.clone();
        processor
            .set_handler::<Ping, _>("Ping", move |ping, session| {
                handler_events
                    .lock()
                    .push(format!("handler:{}:{}", ping.seq, label(session)));
            })
            .unwrap();

        let (router, mut worker) = Router::channel("ping", 8);
        let router_events = events.clone();
        worker.register::<Ping, _>(move |ping, session| {
            router_events
                .lock()
                .push(format!("router:{}:{}", ping.seq, label(session)));
        });
        processor.set_router("Ping", router).unwrap();

        let frames = processor
            .marshal(&Ping {
                seq: 9,
                note: "x".to_string(),
            })
            .unwrap();
        let decoded = processor.unmarshal(&frames[0]).unwrap();
        processor.route(decoded, &session("alice")).unwrap();

        assert_eq!(worker.drain_pending(), 1);
        assert_eq!(
            *events.lock(),
            vec!["handler:9:alice".to_string(), "router:9:alice".to_string()]
        );
    }

    #[test]
    fn test_raw_handler_takes_precedence() {
        let processor = Processor::new();
        processor.register::<Ping>("Ping").unwrap();

        let handled = Arc::new(Mutex::new(Vec::new()));
        let handled_clone = handled.clone();
        processor
            .set_handler::<Ping, _>("Ping", |_, _| panic!("structured handler must not run"))
            .unwrap();
        processor
            .set_raw_handler("Ping", move |raw, _| {
                handled_clone.lock().push(raw.data.clone());
            })
            .unwrap();

        let ping = Ping {
            seq: 3,
            note: "raw".to_string(),
        };
        let frames = processor.marshal(&ping).unwrap();
        let decoded = processor.unmarshal(&frames[0]).unwrap();
        assert!(matches!(decoded, Decoded::Raw(_)));
        processor.route(decoded, &session("a")).unwrap();

        // A typed message for the same identity also goes to the raw handler.
        processor
            .route(TypedMessage::new("Ping", ping.clone()).into(), &session("a"))
            .unwrap();

        let expected = bincode::serialize(&ping).unwrap();
        assert_eq!(*handled.lock(), vec![expected.clone(), expected]);
    }

    #[test]
    fn test_route_errors() {
        let processor = Processor::new();
        processor.register::<Ping>("Ping").unwrap();

        match processor.route(TypedMessage::new("Ghost", Pong { seq: 1 }).into(), &session("a")) {
            Err(RouteError::UnknownMessage(id)) => assert_eq!(id.as_str(), "Ghost"),
            other => panic!("expected unknown message, got {other:?}"),
        }

        let ping = Ping {
            seq: 1,
            note: String::new(),
        };
        assert!(matches!(
            processor.route(TypedMessage::new("Ping", ping).into(), &session("a")),
            Err(RouteError::NoHandler(_))
        ));
        assert!(matches!(
            processor.route(TypedMessage::new("Ping", Pong { seq: 1 }).into(), &session("a")),
            Err(RouteError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_concurrent_route() {
        let processor = Arc::new(Processor::new());
        processor.register::<Pong>("Pong").unwrap();
        let total = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let total_clone = total.clone();
        processor
            .set_handler::<Pong, _>("Pong", move |pong, _| {
                total_clone.fetch_add(pong.seq, Ordering::SeqCst);
            })
            .unwrap();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let processor = processor.clone();
                std::thread::spawn(move || {
                    let session = session("t");
                    for seq in 1..=100u64 {
                        let frames = processor.marshal(&Pong { seq }).unwrap();
                        let decoded = processor.unmarshal(&frames[0]).unwrap();
                        processor.route(decoded, &session).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 4 * 5050);
    }
}
