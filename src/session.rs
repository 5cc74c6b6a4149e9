//! Per-connection session state.
//!
//! The server describes its session-state type with a descriptor stream
//! (`StateDataDescription`); the client serializes its current state with
//! the resulting codec on every parse/execute. A state type change
//! announced by the server also invalidates the per-query codec cache,
//! since the state descriptor id is part of the cache key.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::codec::Codec;
use crate::error::Result;
use crate::proto::TransactionState;
use crate::value::Value;

#[derive(Debug)]
pub struct SessionState {
    /// The server-announced state type id; nil until the server sends one.
    pub state_descriptor_id: Uuid,
    pub state_codec: Option<Arc<Codec>>,
    /// Sparse session configuration (module, aliases, config, globals).
    pub state: Value,
    pub transaction_state: TransactionState,
    /// Raw state blob the server attached to the last `CommandComplete`.
    pub last_command_state: Option<(Uuid, Bytes)>,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            state_descriptor_id: Uuid::nil(),
            state_codec: None,
            state: Value::SparseObject(Vec::new()),
            transaction_state: TransactionState::NotInTransaction,
            last_command_state: None,
        }
    }

    /// Encodes the current session state with the active state codec. With
    /// no codec negotiated yet, the state payload is empty and the nil
    /// type id tells the server so.
    pub fn serialize_state(&self) -> Result<Bytes> {
        match &self.state_codec {
            Some(codec) => {
                let mut w = crate::wire::Writer::new();
                codec.encode(&mut w, &self.state)?;
                Ok(w.into_bytes())
            }
            None => Ok(Bytes::new()),
        }
    }

    /// Sets one sparse state field, e.g. a global or an alias.
    pub fn set_state_field(&mut self, name: impl Into<String>, value: Value) {
        if let Value::SparseObject(fields) = &mut self.state {
            let name = name.into();
            if let Some(slot) = fields.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = value;
            } else {
                fields.push((name, value));
            }
        }
    }

    pub fn apply_command_state(&mut self, id: Uuid, data: Bytes) {
        self.last_command_state = Some((id, data));
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
