//! The dataset tree: local leaves, parallel interior nodes, remote proxies.
//!
//! A dataset is a closed tagged variant so the operation dispatch and the
//! recursion over the tree stay visible in one place. Operations return
//! cold streams of partial results whose progress deltas sum to 1.0 on
//! successful completion:
//! - local leaves execute synchronously, optionally hopping onto the
//!   shared compute pool;
//! - parallel nodes fan out to their children, merge the child streams,
//!   and rescale progress by 1/N;
//! - remote proxies translate operations into streaming RPC calls.
//!
//! Trees are finite and acyclic by construction; datasets are logically
//! immutable and every operation produces a new dataset. Interior
//! mutability of element types is the collaborator's responsibility.

use std::sync::Arc;

use pdq_common::{PdqError, Result};
use tracing::debug;

use crate::ops::{ManageCommand, ManageStatus, MapOp, SketchOp, Wire};
use crate::partial::PartialResult;
use crate::remote::{RemoteDataSet, RemoteLink};
use crate::scheduler::OpContext;
use crate::stream::{Event, PartialStream};
use pdq_common::ObjectId;

/// A dataset of elements of type `T`, fragmented across a tree of local
/// leaves, parallel collections, and remote proxies.
pub enum DataSet<T> {
    /// A leaf holding exactly one value.
    Local(LocalDataSet<T>),
    /// An ordered collection of child datasets.
    Parallel(ParallelDataSet<T>),
    /// A proxy for a dataset living on another process.
    Remote(RemoteDataSet<T>),
}

/// A leaf dataset holding exactly one value of `T`.
pub struct LocalDataSet<T> {
    data: Arc<T>,
    /// When set, operation results are delivered from the compute pool
    /// instead of the subscriber's own task. This is the sole source of
    /// asynchrony for local datasets.
    separate_thread: bool,
}

/// An interior node holding an ordered sequence of children.
pub struct ParallelDataSet<T> {
    children: Vec<Arc<DataSet<T>>>,
}

impl<T: Wire> DataSet<T> {
    /// A leaf delivering results via the compute pool (the default).
    pub fn local(value: T) -> Arc<Self> {
        Self::local_with(value, true)
    }

    /// A leaf delivering results on the subscriber's task.
    pub fn local_inline(value: T) -> Arc<Self> {
        Self::local_with(value, false)
    }

    /// A leaf with explicit delivery placement; `separate_thread` selects
    /// whether results hop onto the compute pool.
    pub fn local_with(value: T, separate_thread: bool) -> Arc<Self> {
        Arc::new(DataSet::Local(LocalDataSet {
            data: Arc::new(value),
            separate_thread,
        }))
    }

    /// An interior node over `children`. An empty sequence is legal and
    /// behaves neutrally under every operation.
    pub fn parallel(children: Vec<Arc<DataSet<T>>>) -> Arc<Self> {
        Arc::new(DataSet::Parallel(ParallelDataSet { children }))
    }

    /// A proxy for the handle `object` reachable through `link`.
    pub fn remote(link: Arc<dyn RemoteLink>, object: ObjectId) -> Arc<Self> {
        Arc::new(DataSet::Remote(RemoteDataSet::new(link, object)))
    }

    /// Applies `mapper` to every leaf, producing a dataset of the same
    /// shape over the mapper's output type.
    pub fn map<M>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<M::Out>>>>
    where
        M: MapOp<T>,
        M::Out: Wire,
    {
        match self {
            DataSet::Local(local) => local.map_stream(mapper, ctx),
            DataSet::Parallel(par) => par.map_stream(mapper, ctx),
            DataSet::Remote(remote) => remote.map_stream(mapper),
        }
    }

    /// Applies `mapper` to every leaf and splices each returned sequence
    /// into a parallel node, flattening one level.
    pub fn flat_map<M, S>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<S>>>>
    where
        M: MapOp<T, Out = Vec<S>>,
        S: Wire,
    {
        match self {
            DataSet::Local(local) => local.flat_map_stream(mapper, ctx),
            DataSet::Parallel(par) => par.flat_map_stream(mapper, ctx),
            DataSet::Remote(remote) => remote.flat_map_stream(mapper),
        }
    }

    /// Pairs this dataset with `other` positionally. Both sides must have
    /// the same variant and, for parallel nodes, the same child count.
    pub fn zip<S: Wire>(
        &self,
        other: &Arc<DataSet<S>>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<(T, S)>>>> {
        match self {
            DataSet::Local(local) => local.zip_stream(other),
            DataSet::Parallel(par) => par.zip_stream(other, ctx),
            DataSet::Remote(remote) => remote.zip_stream(other),
        }
    }

    /// Runs a mergeable sketch over every leaf; the stream refines toward
    /// `fold(add, zero, leaves)`.
    pub fn sketch<K>(
        &self,
        sketch: &Arc<K>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<K::Out>>
    where
        K: SketchOp<T>,
        K::Out: Wire,
    {
        match self {
            DataSet::Local(local) => local.sketch_stream(sketch, ctx),
            DataSet::Parallel(par) => par.sketch_stream(sketch, ctx),
            DataSet::Remote(remote) => remote.sketch_stream(sketch),
        }
    }

    /// Runs a management command against every node of the tree, yielding
    /// one status line per node.
    pub fn manage(
        &self,
        command: ManageCommand,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<ManageStatus>> {
        match self {
            DataSet::Local(local) => local.manage_stream(command),
            DataSet::Parallel(par) => par.manage_stream(command, ctx),
            DataSet::Remote(remote) => remote.manage_stream(command),
        }
    }

    /// Short human-readable description of the node.
    pub fn describe(&self) -> String {
        match self {
            DataSet::Local(_) => "local".to_string(),
            DataSet::Parallel(par) => format!("parallel({})", par.children.len()),
            DataSet::Remote(remote) => format!("remote {}", remote.object_id()),
        }
    }

    /// The leaf value, when this is a local node.
    pub fn local_value(&self) -> Option<&T> {
        match self {
            DataSet::Local(local) => Some(&local.data),
            _ => None,
        }
    }

    /// The children, when this is a parallel node.
    pub fn children(&self) -> Option<&[Arc<DataSet<T>>]> {
        match self {
            DataSet::Parallel(par) => Some(&par.children),
            _ => None,
        }
    }

    /// Clones every leaf value in positional order. Fails on remote
    /// nodes, whose contents are not locally reachable.
    pub fn collect_leaves(&self) -> Result<Vec<T>> {
        match self {
            DataSet::Local(local) => Ok(vec![(*local.data).clone()]),
            DataSet::Parallel(par) => {
                let mut out = Vec::new();
                for child in &par.children {
                    out.extend(child.collect_leaves()?);
                }
                Ok(out)
            }
            DataSet::Remote(remote) => Err(PdqError::TypeMismatch(format!(
                "cannot read leaves of remote dataset {}",
                remote.object_id()
            ))),
        }
    }
}

impl<T: Wire> std::fmt::Debug for DataSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSet::Local(_) => write!(f, "DataSet::Local"),
            DataSet::Parallel(par) => {
                write!(f, "DataSet::Parallel({} children)", par.children.len())
            }
            DataSet::Remote(remote) => write!(f, "DataSet::Remote({})", remote.object_id()),
        }
    }
}

impl<T: Wire> LocalDataSet<T> {
    fn hop<R: Send + 'static>(
        &self,
        stream: PartialStream<R>,
        ctx: &OpContext,
    ) -> PartialStream<R> {
        if self.separate_thread {
            stream.observe_on(ctx.pool())
        } else {
            stream
        }
    }

    fn map_stream<M>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<M::Out>>>>
    where
        M: MapOp<T>,
        M::Out: Wire,
    {
        let data = self.data.clone();
        let mapper = mapper.clone();
        let separate = self.separate_thread;
        let stream = PartialStream::from_callable(move || {
            let out = mapper.apply(&data)?;
            Ok(PartialResult::done(DataSet::local_with(out, separate)))
        });
        self.hop(stream, ctx)
    }

    fn flat_map_stream<M, S>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<S>>>>
    where
        M: MapOp<T, Out = Vec<S>>,
        S: Wire,
    {
        let data = self.data.clone();
        let mapper = mapper.clone();
        let separate = self.separate_thread;
        let stream = PartialStream::from_callable(move || {
            let items = mapper.apply(&data)?;
            let children = items
                .into_iter()
                .map(|item| DataSet::local_with(item, separate))
                .collect();
            Ok(PartialResult::done(DataSet::parallel(children)))
        });
        self.hop(stream, ctx)
    }

    fn zip_stream<S: Wire>(
        &self,
        other: &Arc<DataSet<S>>,
    ) -> PartialStream<PartialResult<Arc<DataSet<(T, S)>>>> {
        // Pairing two leaves is cheap, so there is no zero and no hop.
        match other.as_ref() {
            DataSet::Local(peer) => {
                let pair = ((*self.data).clone(), (*peer.data).clone());
                PartialStream::just(PartialResult::done(DataSet::local_with(
                    pair,
                    self.separate_thread,
                )))
            }
            _ => PartialStream::error(PdqError::TypeMismatch(format!(
                "zip requires a local peer, got {}",
                other.describe()
            ))),
        }
    }

    fn sketch_stream<K>(
        &self,
        sketch: &Arc<K>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<K::Out>>
    where
        K: SketchOp<T>,
        K::Out: Wire,
    {
        // The zero is produced lazily and first, so progress displays can
        // initialize before the sketch itself runs.
        let zero_sketch = sketch.clone();
        let zero = PartialStream::from_callable(move || Ok(PartialResult::zero(zero_sketch.zero())));
        let data = self.data.clone();
        let create_sketch = sketch.clone();
        let created =
            PartialStream::from_callable(move || create_sketch.create(&data).map(PartialResult::done));
        self.hop(zero.concat(created), ctx)
    }

    fn manage_stream(&self, command: ManageCommand) -> PartialStream<PartialResult<ManageStatus>> {
        let result = match command {
            ManageCommand::Ping => "ok".to_string(),
            ManageCommand::LeafCount => "1".to_string(),
        };
        PartialStream::just(PartialResult::done(ManageStatus::new("local", result)))
    }
}

impl<T: Wire> ParallelDataSet<T> {
    /// The ordered children of this node.
    pub fn children(&self) -> &[Arc<DataSet<T>>] {
        &self.children
    }

    fn map_stream<M>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<M::Out>>>>
    where
        M: MapOp<T>,
        M::Out: Wire,
    {
        if self.children.is_empty() {
            return PartialStream::just(PartialResult::done(DataSet::parallel(Vec::new())));
        }
        let tagged = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| child.map(mapper, ctx).map(move |pr| Ok((idx, pr))))
            .collect();
        fan_out_assemble(tagged, DataSet::parallel)
    }

    fn flat_map_stream<M, S>(
        &self,
        mapper: &Arc<M>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<S>>>>
    where
        M: MapOp<T, Out = Vec<S>>,
        S: Wire,
    {
        if self.children.is_empty() {
            return PartialStream::just(PartialResult::done(DataSet::parallel(Vec::new())));
        }
        let tagged = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| child.flat_map(mapper, ctx).map(move |pr| Ok((idx, pr))))
            .collect();
        // Children produce parallel nodes themselves; lift their children
        // into a single flat parallel node.
        fan_out_assemble(tagged, |produced| {
            let mut flat = Vec::new();
            for node in produced {
                match node.as_ref() {
                    DataSet::Parallel(inner) => flat.extend(inner.children.iter().cloned()),
                    _ => flat.push(node),
                }
            }
            DataSet::parallel(flat)
        })
    }

    fn zip_stream<S: Wire>(
        &self,
        other: &Arc<DataSet<S>>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<Arc<DataSet<(T, S)>>>> {
        let peers = match other.as_ref() {
            DataSet::Parallel(peer) => &peer.children,
            _ => {
                return PartialStream::error(PdqError::TypeMismatch(format!(
                    "zip requires a parallel peer, got {}",
                    other.describe()
                )))
            }
        };
        if peers.len() != self.children.len() {
            return PartialStream::error(PdqError::ShapeMismatch(format!(
                "zip child counts differ: {} vs {}",
                self.children.len(),
                peers.len()
            )));
        }
        if self.children.is_empty() {
            return PartialStream::just(PartialResult::done(DataSet::parallel(Vec::new())));
        }
        let tagged = self
            .children
            .iter()
            .zip(peers.iter())
            .enumerate()
            .map(|(idx, (left, right))| left.zip(right, ctx).map(move |pr| Ok((idx, pr))))
            .collect();
        fan_out_assemble(tagged, DataSet::parallel)
    }

    fn sketch_stream<K>(
        &self,
        sketch: &Arc<K>,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<K::Out>>
    where
        K: SketchOp<T>,
        K::Out: Wire,
    {
        let total = self.children.len();
        let zero_sketch = sketch.clone();
        if total == 0 {
            return PartialStream::from_callable(move || {
                Ok(PartialResult::done(zero_sketch.zero()))
            });
        }
        let tagged: Vec<_> = self
            .children
            .iter()
            .enumerate()
            .map(|(idx, child)| child.sketch(sketch, ctx).map(move |pr| Ok((idx, pr))))
            .collect();
        let fold_sketch = sketch.clone();
        let folded = PartialStream::new(move |em| async move {
            // Children emit snapshots, so the fold is recomputed over the
            // latest value seen per child; arrival order across children
            // is nondeterministic.
            let mut latest: Vec<Option<K::Out>> = (0..total).map(|_| None).collect();
            let mut sub = PartialStream::merge(tagged).subscribe_with(em.token().child_token());
            loop {
                match sub.next_event().await {
                    Some(Event::Next((idx, partial))) => {
                        let delta = partial.delta_done;
                        if let Some(value) = partial.payload {
                            latest[idx] = Some(value);
                        }
                        // A child's own zero carries no progress and is
                        // additively neutral; it is not forwarded.
                        if delta == 0.0 {
                            continue;
                        }
                        let mut acc = fold_sketch.zero();
                        for value in latest.iter().flatten() {
                            acc = match fold_sketch.add(acc, value.clone()) {
                                Ok(sum) => sum,
                                Err(e) => {
                                    em.error(e);
                                    return;
                                }
                            };
                        }
                        if !em.next(PartialResult::new(delta / total as f64, Some(acc))) {
                            return;
                        }
                    }
                    Some(Event::Complete) => {
                        em.complete();
                        return;
                    }
                    Some(Event::Error(e)) => {
                        em.error(e);
                        return;
                    }
                    None => return,
                }
            }
        });
        let initial_sketch = sketch.clone();
        PartialStream::from_callable(move || Ok(PartialResult::zero(initial_sketch.zero())))
            .concat(folded)
    }

    fn manage_stream(
        &self,
        command: ManageCommand,
        ctx: &OpContext,
    ) -> PartialStream<PartialResult<ManageStatus>> {
        let total = self.children.len();
        let node = format!("parallel({total})");
        let own_result = match command {
            ManageCommand::Ping => "ok",
            ManageCommand::LeafCount => "0",
        };
        if total == 0 {
            return PartialStream::just(PartialResult::done(ManageStatus::new(node, own_result)));
        }
        let own = PartialStream::from_callable(move || {
            Ok(PartialResult::new(
                0.0,
                Some(ManageStatus::new(node, own_result)),
            ))
        });
        let merged = PartialStream::merge(
            self.children
                .iter()
                .map(|child| child.manage(command.clone(), ctx))
                .collect(),
        )
        .map(move |pr| Ok(pr.scale(1.0 / total as f64)));
        merged.concat(own)
    }
}

/// Shared fan-out skeleton for the dataset-producing operations: forward
/// scaled progress per child emission, remember the latest result per
/// position, and emit one assembled node once every child completed.
fn fan_out_assemble<S: Wire>(
    tagged: Vec<PartialStream<(usize, PartialResult<Arc<DataSet<S>>>)>>,
    assemble: impl FnOnce(Vec<Arc<DataSet<S>>>) -> Arc<DataSet<S>> + Send + 'static,
) -> PartialStream<PartialResult<Arc<DataSet<S>>>> {
    let total = tagged.len();
    PartialStream::new(move |em| async move {
        let mut slots: Vec<Option<Arc<DataSet<S>>>> = (0..total).map(|_| None).collect();
        let mut sub = PartialStream::merge(tagged).subscribe_with(em.token().child_token());
        loop {
            match sub.next_event().await {
                Some(Event::Next((idx, partial))) => {
                    let scaled = partial.delta_done / total as f64;
                    if let Some(node) = partial.payload {
                        slots[idx] = Some(node);
                    }
                    if !em.next(PartialResult::progress(scaled)) {
                        return;
                    }
                }
                Some(Event::Complete) => {
                    let mut produced = Vec::with_capacity(total);
                    for (idx, slot) in slots.into_iter().enumerate() {
                        match slot {
                            Some(node) => produced.push(node),
                            None => {
                                em.error(PdqError::Execution(format!(
                                    "child {idx} completed without producing a dataset"
                                )));
                                return;
                            }
                        }
                    }
                    debug!(children = total, "assembled parallel result");
                    em.next(PartialResult::new(0.0, Some(assemble(produced))));
                    em.complete();
                    return;
                }
                Some(Event::Error(e)) => {
                    em.error(e);
                    return;
                }
                None => return,
            }
        }
    })
}

#[cfg(test)]
#[path = "dataset_tests.rs"]
mod dataset_tests;
