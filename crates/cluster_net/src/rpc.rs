//! Pluggable codec and dispatch strategies.
//!
//! A [`Processor`] with an [`RpcHandler`] installed delegates all of its
//! `marshal`, `unmarshal` and `route` calls to the handler. Handlers receive the
//! processor itself so they can reuse its registry through
//! [`Processor::encode_body`], [`Processor::decode_body`] and
//! [`Processor::dispatch`] while replacing only the parts they care about.

use crate::error::{CodecError, RegistryError, RouteError};
use crate::message::{Decoded, MessageId};
use crate::processor::Processor;
use crate::session::SessionRef;
use std::any::Any;
use std::collections::HashMap;

/// Strategy overriding a processor's wire codec and/or dispatch policy.
pub trait RpcHandler: Send + Sync {
    fn marshal(&self, processor: &Processor, msg: &dyn Any) -> Result<Vec<Vec<u8>>, CodecError>;

    fn unmarshal(&self, processor: &Processor, data: &[u8]) -> Result<Decoded, CodecError>;

    fn route(&self, processor: &Processor, msg: Decoded, session: &SessionRef) -> Result<(), RouteError>;
}

/// Frames messages as a numeric code followed by the body.
///
/// ```text
/// -------------------------
/// | code (u16) | payload  |
/// -------------------------
/// ```
///
/// The code is written in the processor's byte order. Each code is bound to a
/// registered identity; the body uses the processor's payload codec and
/// dispatch is left to [`Processor::dispatch`].
#[derive(Debug, Default, Clone)]
pub struct IdFrameHandler {
    codes: HashMap<u16, MessageId>,
    ids: HashMap<MessageId, u16>,
}

impl IdFrameHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `code` to the identity `id`.
    pub fn bind(mut self, code: u16, id: impl Into<MessageId>) -> Result<Self, RegistryError> {
        let id = id.into();
        if let Some(existing) = self.codes.get(&code) {
            return Err(RegistryError::CodeAlreadyBound {
                code,
                existing: existing.clone(),
            });
        }
        if self.ids.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.codes.insert(code, id.clone());
        self.ids.insert(id, code);
        Ok(self)
    }

    pub fn code_of(&self, id: &MessageId) -> Option<u16> {
        self.ids.get(id).copied()
    }
}

impl RpcHandler for IdFrameHandler {
    fn marshal(&self, processor: &Processor, msg: &dyn Any) -> Result<Vec<Vec<u8>>, CodecError> {
        let (id, body) = processor.encode_body(msg)?;
        let code = self
            .code_of(&id)
            .ok_or(CodecError::UnboundMessage(id))?;
        let header = processor.byte_order().u16_to_bytes(code);
        Ok(vec![header.to_vec(), body])
    }

    fn unmarshal(&self, processor: &Processor, data: &[u8]) -> Result<Decoded, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::MalformedEnvelope(format!(
                "frame of {} bytes has no code",
                data.len()
            )));
        }
        let code = processor.byte_order().u16_from_bytes([data[0], data[1]]);
        let id = self.codes.get(&code).ok_or(CodecError::UnknownCode(code))?;
        processor.decode_body(id, &data[2..])
    }

    fn route(&self, processor: &Processor, msg: Decoded, session: &SessionRef) -> Result<(), RouteError> {
        processor.dispatch(msg, session)
    }
}
