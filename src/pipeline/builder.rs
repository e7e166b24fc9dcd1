//! Ordered middleware list, its frozen form, and the per-route slot that
//! freezes it on first use.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::middleware::{AnyMiddleware, Chain, Middleware, Next, Terminal};
use crate::error::{ConquerorError, Result};
use crate::handler::RequestContext;
use crate::message::short_type_name;

struct PipelineEntry<M, R> {
    id: TypeId,
    name: &'static str,
    middleware: Box<dyn AnyMiddleware<M, R>>,
}

impl<M, R> PipelineEntry<M, R> {
    fn new<T>(middleware: T) -> Self
    where
        T: Middleware<M, R>,
    {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
            middleware: Box::new(middleware),
        }
    }
}

/// Mutable, ordered middleware chain for one message type.
///
/// Middleware runs in list order before the handler and in reverse order
/// after it.
pub struct Pipeline<M, R> {
    name: &'static str,
    entries: Vec<PipelineEntry<M, R>>,
    frozen: bool,
}

impl<M, R> Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Create an empty pipeline for `M`.
    pub fn new() -> Self {
        Self {
            name: short_type_name::<M>(),
            entries: Vec::new(),
            frozen: false,
        }
    }

    /// Append a middleware.
    pub fn use_middleware<T>(&mut self, middleware: T) -> Result<&mut Self>
    where
        T: Middleware<M, R>,
    {
        self.ensure_mutable()?;
        self.entries.push(PipelineEntry::new(middleware));
        Ok(self)
    }

    /// Remove every middleware of type `T`.
    pub fn without<T>(&mut self) -> Result<&mut Self>
    where
        T: Middleware<M, R>,
    {
        self.ensure_mutable()?;
        let id = TypeId::of::<T>();
        self.entries.retain(|entry| entry.id != id);
        Ok(self)
    }

    /// Insert a middleware directly before the first instance of `Marker`.
    pub fn insert_before<Marker, T>(&mut self, middleware: T) -> Result<&mut Self>
    where
        Marker: Middleware<M, R>,
        T: Middleware<M, R>,
    {
        self.ensure_mutable()?;
        let position = self
            .position_of::<Marker>(false)
            .ok_or(ConquerorError::MiddlewareNotFound(short_type_name::<Marker>()))?;
        self.entries.insert(position, PipelineEntry::new(middleware));
        Ok(self)
    }

    /// Insert a middleware directly after the last instance of `Marker`.
    pub fn insert_after<Marker, T>(&mut self, middleware: T) -> Result<&mut Self>
    where
        Marker: Middleware<M, R>,
        T: Middleware<M, R>,
    {
        self.ensure_mutable()?;
        let position = self
            .position_of::<Marker>(true)
            .ok_or(ConquerorError::MiddlewareNotFound(short_type_name::<Marker>()))?;
        self.entries.insert(position + 1, PipelineEntry::new(middleware));
        Ok(self)
    }

    /// Mutate every instance of `T` in place.
    pub fn configure<T, F>(&mut self, mut configure: F) -> Result<&mut Self>
    where
        T: Middleware<M, R>,
        F: FnMut(&mut T),
    {
        self.ensure_mutable()?;
        let id = TypeId::of::<T>();
        let mut found = false;
        for entry in self.entries.iter_mut().filter(|entry| entry.id == id) {
            if let Some(middleware) = entry.middleware.as_any_mut().downcast_mut::<T>() {
                configure(middleware);
                found = true;
            }
        }

        if found {
            Ok(self)
        } else {
            Err(ConquerorError::MiddlewareNotFound(short_type_name::<T>()))
        }
    }

    /// Whether a middleware of type `T` is present.
    pub fn contains<T>(&self) -> bool
    where
        T: Middleware<M, R>,
    {
        let id = TypeId::of::<T>();
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Middleware names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    /// Number of middleware.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pipeline has no middleware.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the pipeline has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze the pipeline into its immutable, shareable form.
    ///
    /// Every later mutation of this pipeline fails with `PipelineFrozen`.
    pub fn freeze(&mut self) -> FrozenPipeline<M, R> {
        self.frozen = true;
        let entries = std::mem::take(&mut self.entries);
        let names = entries.iter().map(|entry| entry.name).collect();
        let chain: Vec<Arc<dyn AnyMiddleware<M, R>>> = entries
            .into_iter()
            .map(|entry| Arc::from(entry.middleware))
            .collect();

        FrozenPipeline {
            chain: chain.into(),
            names: Arc::new(names),
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            Err(ConquerorError::PipelineFrozen(self.name))
        } else {
            Ok(())
        }
    }

    fn position_of<T>(&self, last: bool) -> Option<usize>
    where
        T: Middleware<M, R>,
    {
        let id = TypeId::of::<T>();
        if last {
            self.entries.iter().rposition(|entry| entry.id == id)
        } else {
            self.entries.iter().position(|entry| entry.id == id)
        }
    }
}

impl<M, R> Default for Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable, shareable middleware chain.
pub struct FrozenPipeline<M, R> {
    chain: Chain<M, R>,
    names: Arc<Vec<&'static str>>,
}

impl<M, R> Clone for FrozenPipeline<M, R> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            names: Arc::clone(&self.names),
        }
    }
}

impl<M, R> FrozenPipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Middleware names in execution order.
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Number of middleware.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Whether both handles refer to the same frozen chain.
    pub fn same_as(&self, other: &FrozenPipeline<M, R>) -> bool {
        Arc::ptr_eq(&self.chain, &other.chain)
    }

    /// Run the chain around `terminal`.
    ///
    /// Once this future completes or is dropped, continuations still held by
    /// middleware refuse to run.
    pub(crate) async fn execute(
        &self,
        message: M,
        ctx: RequestContext,
        terminal: Terminal<M, R>,
    ) -> Result<R> {
        let finalized = Arc::new(AtomicBool::new(false));
        let _guard = FinalizeOnDrop(Arc::clone(&finalized));
        Next::start(Arc::clone(&self.chain), terminal, finalized)
            .run(message, ctx)
            .await
    }
}

struct FinalizeOnDrop(Arc<AtomicBool>);

impl Drop for FinalizeOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Closure that configures a [`Pipeline`].
pub type Configurator<M, R> = Arc<dyn Fn(&mut Pipeline<M, R>) -> Result<()> + Send + Sync>;

/// Pipeline configuration of one route, frozen on first dispatch.
pub(crate) struct PipelineSlot<M, R> {
    name: &'static str,
    configurators: RwLock<Vec<Configurator<M, R>>>,
    frozen: OnceLock<FrozenPipeline<M, R>>,
}

impl<M, R> PipelineSlot<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            name: short_type_name::<M>(),
            configurators: RwLock::new(Vec::new()),
            frozen: OnceLock::new(),
        }
    }

    /// Append a configuration closure.
    pub(crate) fn configure(&self, configurator: Configurator<M, R>) -> Result<()> {
        let mut configurators = self.configurators.write();
        if self.frozen.get().is_some() {
            return Err(ConquerorError::PipelineFrozen(self.name));
        }
        configurators.push(configurator);
        Ok(())
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Build a fresh pipeline from the stored configuration.
    pub(crate) fn build(&self) -> Result<FrozenPipeline<M, R>> {
        let configurators = self.configurators.read();
        Self::build_from(&configurators)
    }

    /// Return the frozen pipeline, building it on first use.
    pub(crate) fn frozen(&self) -> Result<FrozenPipeline<M, R>> {
        if let Some(pipeline) = self.frozen.get() {
            return Ok(pipeline.clone());
        }

        let configurators = self.configurators.write();
        if let Some(pipeline) = self.frozen.get() {
            return Ok(pipeline.clone());
        }

        let pipeline = Self::build_from(&configurators)?;
        tracing::debug!(
            "Froze pipeline for {} with {} middleware",
            self.name,
            pipeline.len()
        );
        Ok(self.frozen.get_or_init(|| pipeline).clone())
    }

    fn build_from(configurators: &[Configurator<M, R>]) -> Result<FrozenPipeline<M, R>> {
        let mut pipeline = Pipeline::new();
        for configure in configurators {
            configure(&mut pipeline)?;
        }
        Ok(pipeline.freeze())
    }
}
