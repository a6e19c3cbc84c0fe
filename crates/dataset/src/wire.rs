//! Byte-level envelopes for operations and partial results crossing the
//! RPC boundary.
//!
//! The transport carries opaque bytes; the schema here is owned by the
//! sketch/map/handle contracts. Envelopes are JSON, matching how plan
//! fragments travel elsewhere in the stack.

use pdq_common::{CallId, ObjectId, PdqError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ops::NamedOp;
use crate::partial::PartialResult;

/// Transport-level request addressing a server-side dataset handle.
///
/// `ids_index` disambiguates multi-dataset calls; the subscription target
/// is always resolved from `(high_id, low_id)` and peers travel inside the
/// serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCommand {
    /// Index into the referenced handles for multi-dataset calls.
    pub ids_index: i32,
    /// High half of the target handle id.
    pub high_id: i64,
    /// Low half of the target handle id.
    pub low_id: i64,
    /// Serialized [`OpEnvelope`].
    pub serialized_op: Vec<u8>,
}

impl WireCommand {
    /// Addresses `target` with the given envelope.
    pub fn new(target: ObjectId, envelope: &OpEnvelope) -> Result<Self> {
        Ok(Self {
            ids_index: 0,
            high_id: target.high,
            low_id: target.low,
            serialized_op: envelope.encode()?,
        })
    }

    /// The addressed handle id.
    pub fn target(&self) -> ObjectId {
        ObjectId::new(self.high_id, self.low_id)
    }
}

/// Named operation payload plus the call id used for `unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpEnvelope {
    /// Registry name of the operation.
    pub op: String,
    /// Client-minted call id identifying the pending subscription.
    pub call: i64,
    /// Operation body (a serialized map, sketch, command, or peer
    /// reference).
    pub body: serde_json::Value,
}

impl OpEnvelope {
    /// Wraps a named op value.
    pub fn for_op<O: NamedOp>(call: CallId, op: &O) -> Result<Self> {
        Ok(Self {
            op: O::NAME.to_string(),
            call: call.0,
            body: serde_json::to_value(op).map_err(|e| PdqError::Serde(e.to_string()))?,
        })
    }

    /// Wraps an arbitrary named body.
    pub fn with_body(name: &str, call: CallId, body: serde_json::Value) -> Self {
        Self {
            op: name.to_string(),
            call: call.0,
            body,
        }
    }

    /// Serializes the envelope for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PdqError::Serde(e.to_string()))
    }

    /// Parses an envelope from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PdqError::Serde(format!("op envelope: {e}")))
    }

    /// Deserializes the body into a concrete op or command value.
    pub fn body_as<B: DeserializeOwned>(&self) -> Result<B> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| PdqError::Serde(format!("op body for {}: {e}", self.op)))
    }
}

/// One partial result as it travels inside a `PartialResponse`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WirePartial {
    /// Progress increment in `[0, 1]`.
    pub delta_done: f64,
    /// Serialized payload, if this increment carries one.
    pub payload: Option<serde_json::Value>,
}

impl WirePartial {
    /// Serializes a typed partial result.
    pub fn from_partial<R: Serialize>(partial: &PartialResult<R>) -> Result<Self> {
        let payload = match &partial.payload {
            Some(r) => {
                Some(serde_json::to_value(r).map_err(|e| PdqError::Serde(e.to_string()))?)
            }
            None => None,
        };
        Ok(Self {
            delta_done: partial.delta_done,
            payload,
        })
    }

    /// Decodes into a typed partial result.
    pub fn into_partial<R: DeserializeOwned>(self) -> Result<PartialResult<R>> {
        let payload = match self.payload {
            Some(v) => Some(
                serde_json::from_value(v)
                    .map_err(|e| PdqError::Serde(format!("partial payload: {e}")))?,
            ),
            None => None,
        };
        Ok(PartialResult::new(self.delta_done, payload))
    }

    /// Serializes for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PdqError::Serde(e.to_string()))
    }

    /// Parses from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PdqError::Serde(format!("wire partial: {e}")))
    }
}

/// Envelope body of a zip call: the peer handle living on the same server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZipBody {
    /// The peer dataset handle.
    pub peer: ObjectId,
}

/// Envelope name used by `unsubscribe` commands; the envelope's `call`
/// field addresses the pending subscription.
pub const UNSUBSCRIBE_OP: &str = "unsubscribe";

/// Envelope name used by `prune` commands.
pub const PRUNE_OP: &str = "prune";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips() {
        let env = OpEnvelope::with_body("sum", CallId(9), serde_json::json!({"seed": 3}));
        let decoded = OpEnvelope::decode(&env.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, env);
    }

    #[test]
    fn wire_partial_roundtrips_typed_payloads() {
        let partial = PartialResult::done(vec![1i64, 2, 3]);
        let wire = WirePartial::from_partial(&partial).expect("to wire");
        let back: PartialResult<Vec<i64>> =
            WirePartial::decode(&wire.encode().expect("encode"))
                .expect("decode")
                .into_partial()
                .expect("typed");
        assert_eq!(back, partial);
    }

    #[test]
    fn progress_only_partial_has_no_payload() {
        let wire = WirePartial::from_partial(&PartialResult::<i64>::progress(0.5)).expect("wire");
        assert_eq!(wire.payload, None);
        assert!((wire.delta_done - 0.5).abs() < 1e-12);
    }
}
