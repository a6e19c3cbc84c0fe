//! Partial results: a progress delta plus an optional payload.

use pdq_common::Result;

/// One increment of an operation's output stream.
///
/// `delta_done` is the fraction of the total work this item represents;
/// across a successful subscription the deltas sum to 1.0. The payload is
/// optional so progress can be reported without a value (and so the merge
/// identity can be expressed).
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult<R> {
    /// Progress increment in `[0, 1]`.
    pub delta_done: f64,
    /// Payload carried by this increment, if any.
    pub payload: Option<R>,
}

impl<R> PartialResult<R> {
    /// Builds a partial result, clamping the delta into `[0, 1]`.
    pub fn new(delta_done: f64, payload: Option<R>) -> Self {
        Self {
            delta_done: delta_done.clamp(0.0, 1.0),
            payload,
        }
    }

    /// A completed result: full progress with a payload.
    pub fn done(payload: R) -> Self {
        Self::new(1.0, Some(payload))
    }

    /// The initial zero: no progress yet, payload is the merge identity.
    pub fn zero(payload: R) -> Self {
        Self::new(0.0, Some(payload))
    }

    /// A payload-free progress report.
    pub fn progress(delta_done: f64) -> Self {
        Self::new(delta_done, None)
    }

    /// Rescales the progress delta, keeping the payload.
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.delta_done * factor, self.payload)
    }

    /// Transforms the payload.
    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> PartialResult<S> {
        PartialResult {
            delta_done: self.delta_done,
            payload: self.payload.map(f),
        }
    }

    /// Transforms the payload with a fallible function.
    pub fn try_map<S>(self, f: impl FnOnce(R) -> Result<S>) -> Result<PartialResult<S>> {
        let payload = match self.payload {
            Some(r) => Some(f(r)?),
            None => None,
        };
        Ok(PartialResult {
            delta_done: self.delta_done,
            payload,
        })
    }

    /// Merges two partials: deltas add, payloads combine under `add`.
    /// A missing payload acts as the identity.
    pub fn merge_with(self, other: Self, add: impl FnOnce(R, R) -> Result<R>) -> Result<Self> {
        let payload = match (self.payload, other.payload) {
            (Some(a), Some(b)) => Some(add(a, b)?),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        Ok(Self::new(self.delta_done + other.delta_done, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_delta_into_range() {
        assert_eq!(PartialResult::<i64>::progress(2.0).delta_done, 1.0);
        assert_eq!(PartialResult::<i64>::progress(-0.5).delta_done, 0.0);
    }

    #[test]
    fn merge_adds_deltas_and_payloads() {
        let a = PartialResult::new(0.25, Some(3i64));
        let b = PartialResult::new(0.5, Some(4i64));
        let merged = a.merge_with(b, |x, y| Ok(x + y)).expect("merge");
        assert!((merged.delta_done - 0.75).abs() < 1e-12);
        assert_eq!(merged.payload, Some(7));
    }

    #[test]
    fn merge_treats_missing_payload_as_identity() {
        let a = PartialResult::new(0.25, None);
        let b = PartialResult::new(0.25, Some(4i64));
        let merged = a.merge_with(b, |x, y| Ok(x + y)).expect("merge");
        assert_eq!(merged.payload, Some(4));
    }
}
