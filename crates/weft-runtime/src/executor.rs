//! Executors: declarative, identity-stable descriptions of how to build a value.
//!
//! An executor never holds a value itself. Values live in a [`Scope`](crate::Scope),
//! cached per executor. Dependencies are fixed at construction, so the
//! dependency graph of executors is acyclic by construction.
//!
//! The dependency shape mirrors what the factory receives:
//!
//! | deps | factory receives |
//! |---|---|
//! | `()` (via [`provide`]) | nothing |
//! | `Executor<A>` | `Arc<A>` |
//! | `(Executor<A>, Executor<B>, ..)` | `(Arc<A>, Arc<B>, ..)` |
//! | `Vec<Executor<T>>` | `Vec<Arc<T>>` |
//! | `BTreeMap<String, Executor<T>>` | `BTreeMap<String, Arc<T>>` |

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::{Result, WeftError};
use weft_core::tag::{Tag, Tagged};
use weft_core::types::{downcast, erase, AnyValue};

use crate::scope::FactoryContext;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique executor identity. Ordered by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(u64);

impl ExecutorId {
    fn next() -> Self {
        Self(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

pub(crate) type ErasedFactory = Arc<
    dyn Fn(ResolvedDependencies, FactoryContext) -> BoxFuture<'static, Result<AnyValue>>
        + Send
        + Sync,
>;

/// Type-erased dependency declaration.
#[derive(Clone)]
pub enum DependencyShape {
    None,
    Single(AnyExecutor),
    List(Vec<AnyExecutor>),
    Map(BTreeMap<String, AnyExecutor>),
}

impl DependencyShape {
    pub fn executors(&self) -> Vec<&AnyExecutor> {
        match self {
            Self::None => Vec::new(),
            Self::Single(e) => vec![e],
            Self::List(list) => list.iter().collect(),
            Self::Map(map) => map.values().collect(),
        }
    }

    pub fn contains(&self, id: ExecutorId) -> bool {
        self.executors().iter().any(|e| e.id() == id)
    }
}

/// Resolved values, in the same shape as the declaration.
pub enum ResolvedDependencies {
    None,
    Single(AnyValue),
    List(Vec<AnyValue>),
    Map(BTreeMap<String, AnyValue>),
}

impl ResolvedDependencies {
    fn into_single(self) -> Result<AnyValue> {
        match self {
            Self::Single(v) => Ok(v),
            _ => Err(shape_mismatch("single")),
        }
    }

    fn into_list(self) -> Result<Vec<AnyValue>> {
        match self {
            Self::List(v) => Ok(v),
            _ => Err(shape_mismatch("list")),
        }
    }

    fn into_map(self) -> Result<BTreeMap<String, AnyValue>> {
        match self {
            Self::Map(v) => Ok(v),
            _ => Err(shape_mismatch("map")),
        }
    }
}

fn shape_mismatch(expected: &str) -> WeftError {
    WeftError::Internal(format!("resolved dependencies are not a {} shape", expected))
}

pub(crate) struct ExecutorNode {
    id: ExecutorId,
    name: String,
    dependencies: DependencyShape,
    factory: ErasedFactory,
    tags: Vec<Tagged>,
}

/// Type-erased executor handle.
#[derive(Clone)]
pub struct AnyExecutor {
    node: Arc<ExecutorNode>,
}

impl AnyExecutor {
    pub fn id(&self) -> ExecutorId {
        self.node.id
    }

    /// Human-readable identity used in errors and logs.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn dependencies(&self) -> &DependencyShape {
        &self.node.dependencies
    }

    pub fn tags(&self) -> &[Tagged] {
        &self.node.tags
    }

    pub(crate) fn factory(&self) -> ErasedFactory {
        self.node.factory.clone()
    }
}

impl PartialEq for AnyExecutor {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnyExecutor {}

impl Hash for AnyExecutor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for AnyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Typed executor producing a `T`.
pub struct Executor<T> {
    node: Arc<ExecutorNode>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Executor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Executor<T> {
    fn from_parts(name: String, dependencies: DependencyShape, factory: ErasedFactory) -> Self {
        Self {
            node: Arc::new(ExecutorNode {
                id: ExecutorId::next(),
                name,
                dependencies,
                factory,
                tags: Vec::new(),
            }),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ExecutorId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn tags(&self) -> &[Tagged] {
        &self.node.tags
    }

    pub fn erased(&self) -> AnyExecutor {
        AnyExecutor {
            node: self.node.clone(),
        }
    }

    /// Attach metadata. Identity is preserved.
    pub fn with_tag(self, tagged: Tagged) -> Self {
        self.with_tags([tagged])
    }

    pub fn with_tags(self, tagged: impl IntoIterator<Item = Tagged>) -> Self {
        let node = &self.node;
        let mut tags = node.tags.clone();
        tags.extend(tagged);
        Self {
            node: Arc::new(ExecutorNode {
                id: node.id,
                name: node.name.clone(),
                dependencies: node.dependencies.clone(),
                factory: node.factory.clone(),
                tags,
            }),
            _marker: PhantomData,
        }
    }

    /// Read a metadata tag (default substituted when absent).
    pub fn tag<V: Clone + Send + Sync + 'static>(&self, tag: &Tag<V>) -> Option<V> {
        tag.read_from(self.tags())
    }
}

/// A dependency declaration whose resolved form is handed to a factory.
pub trait Dependencies: Send + Sync + 'static {
    type Output: Send + 'static;

    fn shape(&self) -> DependencyShape;

    fn extract(&self, resolved: ResolvedDependencies) -> Result<Self::Output>;
}

impl<T: Send + Sync + 'static> Dependencies for Executor<T> {
    type Output = Arc<T>;

    fn shape(&self) -> DependencyShape {
        DependencyShape::Single(self.erased())
    }

    fn extract(&self, resolved: ResolvedDependencies) -> Result<Self::Output> {
        downcast::<T>(resolved.into_single()?, self.name())
    }
}

impl<T: Send + Sync + 'static> Dependencies for Vec<Executor<T>> {
    type Output = Vec<Arc<T>>;

    fn shape(&self) -> DependencyShape {
        DependencyShape::List(self.iter().map(Executor::erased).collect())
    }

    fn extract(&self, resolved: ResolvedDependencies) -> Result<Self::Output> {
        resolved
            .into_list()?
            .into_iter()
            .zip(self.iter())
            .map(|(value, executor)| downcast::<T>(value, executor.name()))
            .collect()
    }
}

impl<T: Send + Sync + 'static> Dependencies for BTreeMap<String, Executor<T>> {
    type Output = BTreeMap<String, Arc<T>>;

    fn shape(&self) -> DependencyShape {
        DependencyShape::Map(
            self.iter()
                .map(|(k, e)| (k.clone(), e.erased()))
                .collect(),
        )
    }

    fn extract(&self, resolved: ResolvedDependencies) -> Result<Self::Output> {
        let mut values = resolved.into_map()?;
        self.iter()
            .map(|(key, executor)| {
                let value = values
                    .remove(key)
                    .ok_or_else(|| shape_mismatch("complete map"))?;
                Ok((key.clone(), downcast::<T>(value, executor.name())?))
            })
            .collect()
    }
}

macro_rules! tuple_dependencies {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: Send + Sync + 'static),+> Dependencies for ($(Executor<$ty>,)+) {
            type Output = ($(Arc<$ty>,)+);

            fn shape(&self) -> DependencyShape {
                DependencyShape::List(vec![$(self.$idx.erased()),+])
            }

            fn extract(&self, resolved: ResolvedDependencies) -> Result<Self::Output> {
                let mut values = resolved.into_list()?.into_iter();
                Ok(($(
                    downcast::<$ty>(
                        values.next().ok_or_else(|| shape_mismatch("complete list"))?,
                        self.$idx.name(),
                    )?,
                )+))
            }
        }
    };
}

tuple_dependencies!(A: 0);
tuple_dependencies!(A: 0, B: 1);
tuple_dependencies!(A: 0, B: 1, C: 2);
tuple_dependencies!(A: 0, B: 1, C: 2, D: 3);
tuple_dependencies!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_dependencies!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Create a root executor with no dependencies.
pub fn provide<T, F, Fut>(name: impl Into<String>, factory: F) -> Executor<T>
where
    T: Send + Sync + 'static,
    F: Fn(FactoryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let erased: ErasedFactory = Arc::new(move |_deps, ctx| {
        let fut = factory(ctx);
        async move { fut.await.map(erase) }.boxed()
    });
    Executor::from_parts(name.into(), DependencyShape::None, erased)
}

/// Create a derived executor. The factory receives `deps` in resolved form.
pub fn derive<D, T, F, Fut>(name: impl Into<String>, deps: D, factory: F) -> Executor<T>
where
    D: Dependencies,
    T: Send + Sync + 'static,
    F: Fn(D::Output, FactoryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let shape = deps.shape();
    let erased: ErasedFactory = Arc::new(move |resolved, ctx| match deps.extract(resolved) {
        Ok(values) => {
            let fut = factory(values, ctx);
            async move { fut.await.map(erase) }.boxed()
        }
        Err(e) => futures::future::ready(Err(e)).boxed(),
    });
    Executor::from_parts(name.into(), shape, erased)
}
