//! In-process loopback link.
//!
//! Serves the same command path as the gRPC service without sockets, for
//! single-process deployments and tests that exercise remote semantics
//! (subscription registration, unsubscribe, prune) end to end.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use pdq_common::{CallId, ObjectId, Result};
use pdq_dataset::{
    OpContext, OpEnvelope, PartialStream, RemoteLink, RemoteMethod, WireCommand, WirePartial,
};

use crate::dispatch::run_command;
use crate::manager::RpcObjectManager;

/// A loopback transport targeting a registry in the same process.
pub struct InProcessLink {
    manager: Arc<RpcObjectManager>,
    ctx: OpContext,
    call_seed: i64,
    call_counter: AtomicI64,
}

impl std::fmt::Debug for InProcessLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InProcessLink")
    }
}

impl InProcessLink {
    /// Builds a link against the given registry.
    pub fn new(manager: Arc<RpcObjectManager>, ctx: OpContext) -> Arc<Self> {
        let (seed, _) = uuid::Uuid::new_v4().as_u64_pair();
        Arc::new(Self {
            manager,
            ctx,
            call_seed: seed as i64,
            call_counter: AtomicI64::new(1),
        })
    }

    /// The registry this link targets.
    pub fn manager(&self) -> &Arc<RpcObjectManager> {
        &self.manager
    }
}

impl RemoteLink for InProcessLink {
    fn mint_call(&self) -> CallId {
        let next = self.call_counter.fetch_add(1, Ordering::Relaxed);
        CallId(self.call_seed.wrapping_add(next))
    }

    fn invoke(&self, method: RemoteMethod, command: WireCommand) -> PartialStream<WirePartial> {
        match run_command(&self.manager, &self.ctx, method, &command) {
            Ok(stream) => stream,
            Err(e) => PartialStream::error(e),
        }
    }

    fn unsubscribe(&self, command: WireCommand) -> BoxFuture<'static, Result<()>> {
        let manager = self.manager.clone();
        async move {
            let envelope = OpEnvelope::decode(&command.serialized_op)?;
            manager.unsubscribe(CallId(envelope.call));
            Ok(())
        }
        .boxed()
    }

    fn prune(&self, object: ObjectId) {
        self.manager.prune(object);
    }
}
