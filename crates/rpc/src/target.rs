//! Type-erased dataset targets and the named op registry.
//!
//! The registry stores datasets of many element types behind one
//! object-safe trait. Each [`TypedTarget`] pairs a dataset with an
//! [`OpLibrary`] mapping wire-level op names onto deserializers for the
//! concrete map/sketch types; registering an op also supplies the output
//! library so produced datasets remain servable. Zip pairings are
//! registered per peer element type and resolved by runtime downcast,
//! the closed-world equivalent of the erased-registry dispatch in
//! dynamically typed RPC layers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use pdq_common::{PdqError, Result};
use pdq_dataset::{
    DataSet, ManageCommand, MapOp, OpContext, OpEnvelope, PartialResult, PartialStream, SketchOp,
    Wire,
};
use serde::de::DeserializeOwned;

/// Stream of handle-producing partials emitted by an erased target.
pub type TargetDataStream = PartialStream<PartialResult<Arc<dyn DataTarget>>>;

/// Stream of serialized value partials emitted by an erased target.
pub type TargetValueStream = PartialStream<PartialResult<serde_json::Value>>;

/// A registered dataset handle, erased over its element type.
pub trait DataTarget: Send + Sync + 'static {
    /// Downcast support for zip pairings.
    fn as_any(&self) -> &dyn Any;

    /// Short description for logs and error messages.
    fn describe(&self) -> String;

    /// Runs a registered map op named by the envelope.
    fn run_map(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetDataStream>;

    /// Runs a registered flat-map op named by the envelope.
    fn run_flat_map(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetDataStream>;

    /// Runs a registered sketch op named by the envelope.
    fn run_sketch(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetValueStream>;

    /// Zips this target with an already-resolved peer handle.
    fn run_zip(
        &self,
        envelope: &OpEnvelope,
        peer: &Arc<dyn DataTarget>,
        ctx: &OpContext,
    ) -> Result<TargetDataStream>;

    /// Runs a management command carried in the envelope body.
    fn run_manage(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetValueStream>;
}

type MapRun<T> =
    Arc<dyn Fn(&Arc<DataSet<T>>, &OpEnvelope, &OpContext) -> Result<TargetDataStream> + Send + Sync>;
type SketchRun<T> = Arc<
    dyn Fn(&Arc<DataSet<T>>, &OpEnvelope, &OpContext) -> Result<TargetValueStream> + Send + Sync,
>;
type ZipRun<T> = Arc<
    dyn Fn(&Arc<DataSet<T>>, &Arc<dyn DataTarget>, &OpContext) -> Option<Result<TargetDataStream>>
        + Send
        + Sync,
>;

/// Named operations servable against datasets of element type `T`.
pub struct OpLibrary<T: Wire> {
    maps: HashMap<String, MapRun<T>>,
    flat_maps: HashMap<String, MapRun<T>>,
    sketches: HashMap<String, SketchRun<T>>,
    zips: Vec<ZipRun<T>>,
}

impl<T: Wire> OpLibrary<T> {
    /// An empty library.
    pub fn new() -> Self {
        Self {
            maps: HashMap::new(),
            flat_maps: HashMap::new(),
            sketches: HashMap::new(),
            zips: Vec::new(),
        }
    }

    /// Registers a map op; produced datasets are served through
    /// `out_library`. The library is held weakly, so the caller keeps it
    /// alive for as long as the op should stay servable.
    pub fn register_map<M>(&mut self, out_library: &Arc<OpLibrary<M::Out>>)
    where
        M: MapOp<T> + DeserializeOwned,
        M::Out: Wire,
    {
        self.register_map_deferred::<M>(Arc::downgrade(out_library));
    }

    /// [`OpLibrary::register_map`] for a library that is still being
    /// built, e.g. a self-referential one inside `Arc::new_cyclic`.
    pub fn register_map_deferred<M>(&mut self, out_library: Weak<OpLibrary<M::Out>>)
    where
        M: MapOp<T> + DeserializeOwned,
        M::Out: Wire,
    {
        let run: MapRun<T> = Arc::new(move |dataset, envelope, ctx| {
            let mapper: Arc<M> = Arc::new(envelope.body_as::<M>()?);
            let out_library = upgrade(&out_library, M::NAME)?;
            Ok(dataset.map(&mapper, ctx).map(move |partial| {
                Ok(partial.map(|child| TypedTarget::wrap(child, out_library.clone())))
            }))
        });
        self.maps.insert(M::NAME.to_string(), run);
    }

    /// Registers a flat-map op; produced datasets are served through
    /// `out_library`.
    pub fn register_flat_map<M, S>(&mut self, out_library: &Arc<OpLibrary<S>>)
    where
        M: MapOp<T, Out = Vec<S>> + DeserializeOwned,
        S: Wire,
    {
        self.register_flat_map_deferred::<M, S>(Arc::downgrade(out_library));
    }

    /// [`OpLibrary::register_flat_map`] for a library still being built.
    pub fn register_flat_map_deferred<M, S>(&mut self, out_library: Weak<OpLibrary<S>>)
    where
        M: MapOp<T, Out = Vec<S>> + DeserializeOwned,
        S: Wire,
    {
        let run: MapRun<T> = Arc::new(move |dataset, envelope, ctx| {
            let mapper: Arc<M> = Arc::new(envelope.body_as::<M>()?);
            let out_library = upgrade(&out_library, M::NAME)?;
            Ok(dataset.flat_map(&mapper, ctx).map(move |partial| {
                Ok(partial.map(|child| TypedTarget::wrap(child, out_library.clone())))
            }))
        });
        self.flat_maps.insert(M::NAME.to_string(), run);
    }

    /// Registers a sketch op; results are serialized for the wire.
    pub fn register_sketch<K>(&mut self)
    where
        K: SketchOp<T> + DeserializeOwned,
        K::Out: Wire,
    {
        let run: SketchRun<T> = Arc::new(move |dataset, envelope, ctx| {
            let sketch: Arc<K> = Arc::new(envelope.body_as::<K>()?);
            Ok(dataset.sketch(&sketch, ctx).map(|partial| {
                partial.try_map(|value| {
                    serde_json::to_value(value).map_err(|e| PdqError::Serde(e.to_string()))
                })
            }))
        });
        self.sketches.insert(K::NAME.to_string(), run);
    }

    /// Registers a zip pairing against peers of element type `S`;
    /// produced pair datasets are served through `out_library`.
    pub fn register_zip<S>(&mut self, out_library: &Arc<OpLibrary<(T, S)>>)
    where
        S: Wire,
    {
        self.register_zip_deferred::<S>(Arc::downgrade(out_library));
    }

    /// [`OpLibrary::register_zip`] for a library still being built.
    pub fn register_zip_deferred<S>(&mut self, out_library: Weak<OpLibrary<(T, S)>>)
    where
        S: Wire,
    {
        let run: ZipRun<T> = Arc::new(move |dataset, peer, ctx| {
            let typed = peer.as_any().downcast_ref::<TypedTarget<S>>()?;
            let out_library = match upgrade(&out_library, "zip") {
                Ok(library) => library,
                Err(e) => return Some(Err(e)),
            };
            Some(Ok(dataset.zip(&typed.dataset, ctx).map(move |partial| {
                Ok(partial.map(|child| TypedTarget::wrap(child, out_library.clone())))
            })))
        });
        self.zips.push(run);
    }
}

fn upgrade<T: Wire>(library: &Weak<OpLibrary<T>>, op: &str) -> Result<Arc<OpLibrary<T>>> {
    library.upgrade().ok_or_else(|| {
        PdqError::InvalidConfig(format!("output op library for {op} is no longer alive"))
    })
}

impl<T: Wire> Default for OpLibrary<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A dataset of a concrete element type paired with its op library.
pub struct TypedTarget<T: Wire> {
    dataset: Arc<DataSet<T>>,
    library: Arc<OpLibrary<T>>,
}

impl<T: Wire> TypedTarget<T> {
    /// Pairs a dataset with the library serving it.
    pub fn new(dataset: Arc<DataSet<T>>, library: Arc<OpLibrary<T>>) -> Self {
        Self { dataset, library }
    }

    /// Wraps into an erased registry entry.
    pub fn wrap(dataset: Arc<DataSet<T>>, library: Arc<OpLibrary<T>>) -> Arc<dyn DataTarget> {
        Arc::new(Self::new(dataset, library))
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &Arc<DataSet<T>> {
        &self.dataset
    }
}

impl<T: Wire> DataTarget for TypedTarget<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!(
            "{} over {}",
            self.dataset.describe(),
            std::any::type_name::<T>()
        )
    }

    fn run_map(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetDataStream> {
        let run = self.library.maps.get(&envelope.op).ok_or_else(|| {
            PdqError::InvalidConfig(format!("unknown map operation: {}", envelope.op))
        })?;
        run(&self.dataset, envelope, ctx)
    }

    fn run_flat_map(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetDataStream> {
        let run = self.library.flat_maps.get(&envelope.op).ok_or_else(|| {
            PdqError::InvalidConfig(format!("unknown flat-map operation: {}", envelope.op))
        })?;
        run(&self.dataset, envelope, ctx)
    }

    fn run_sketch(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetValueStream> {
        let run = self.library.sketches.get(&envelope.op).ok_or_else(|| {
            PdqError::InvalidConfig(format!("unknown sketch operation: {}", envelope.op))
        })?;
        run(&self.dataset, envelope, ctx)
    }

    fn run_zip(
        &self,
        _envelope: &OpEnvelope,
        peer: &Arc<dyn DataTarget>,
        ctx: &OpContext,
    ) -> Result<TargetDataStream> {
        for run in &self.library.zips {
            if let Some(result) = run(&self.dataset, peer, ctx) {
                return result;
            }
        }
        Err(PdqError::TypeMismatch(format!(
            "no zip pairing registered for peer {}",
            peer.describe()
        )))
    }

    fn run_manage(&self, envelope: &OpEnvelope, ctx: &OpContext) -> Result<TargetValueStream> {
        let command: ManageCommand = envelope.body_as()?;
        Ok(self.dataset.manage(command, ctx).map(|partial| {
            partial.try_map(|status| {
                serde_json::to_value(status).map_err(|e| PdqError::Serde(e.to_string()))
            })
        }))
    }
}
