use anyhow::{Context, Result};
use std::marker::PhantomData;
use std::sync::Arc;

/// Defines the core `Transform` trait for composable data processing pipelines.
///
/// The `Transform<I, O>` trait represents a stateless operation for
/// converting an input of type `I` to an output of type `O`.
/// Multiple `Transform` steps can be chained together via `.then(...)`
/// to form a single, inlined preprocessing pipeline.
///
/// Note: `then()` works only when:
/// 1. **Types align**: `self: Transform<I, O>`, `next: Transform<O, M>`
/// 2. **Owned**: `Self::Sized` (no trait objects, must be concrete)
/// 3. **Thread-safe**: intermediate and output types must be `Send`
pub trait Transform<I, O>: Send + Sync {
    /// Applies the transformation to the input
    fn apply(&self, input: I) -> Result<O>;

    #[inline]
    fn then<T, M>(self, next: T) -> Chain<Self, T, O>
    where
        Self: Sized,
        T: Transform<O, M>,
        O: Send,
        M: Send,
    {
        Chain {
            first: self,
            second: next,
            _marker: PhantomData,
        }
    }
}

impl<I, O, T> Transform<I, O> for Box<T>
where
    T: Transform<I, O> + ?Sized,
{
    fn apply(&self, input: I) -> Result<O> {
        (**self).apply(input)
    }
}

impl<I, O, T> Transform<I, O> for Arc<T>
where
    T: Transform<I, O> + ?Sized,
{
    fn apply(&self, input: I) -> Result<O> {
        (**self).apply(input)
    }
}

/// A chain of two transforms (`A` -> `B`)
/// - `PhantomData<M>` enforces intermediate type alignment.
#[derive(Debug)]
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _marker: PhantomData<fn() -> M>,
}

impl<A, B, M> Chain<A, B, M> {
    /// Creates a new transform chain.
    /// Use [`Transform::then`] for better ergonomics. `Chain::new` is
    /// useful when building pipelines dynamically.
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            _marker: PhantomData,
        }
    }
}

impl<I, M, O, A, B> Transform<I, O> for Chain<A, B, M>
where
    A: Transform<I, M>,
    B: Transform<M, O>,
    M: Send,
{
    fn apply(&self, input: I) -> Result<O> {
        self.first
            .apply(input)
            .and_then(|mid| self.second.apply(mid))
            .with_context(|| {
                format!(
                    "Transform chain failed: {} → {} → {}",
                    std::any::type_name::<A>(),
                    std::any::type_name::<B>(),
                    std::any::type_name::<O>()
                )
            })
    }
}

/// Passes its input through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<T> Transform<T, T> for Identity {
    fn apply(&self, input: T) -> Result<T> {
        Ok(input)
    }
}

/// Wraps a closure so user callables can be used as hooks.
pub struct FnTransform<F, I, O> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

/// Builds a transform from a closure.
///
/// ```ignore
/// let double = from_fn(|t: Tensor| Ok(t * 2));
/// ```
pub fn from_fn<F, I, O>(f: F) -> FnTransform<F, I, O>
where
    F: Fn(I) -> Result<O> + Send + Sync,
{
    FnTransform {
        f,
        _marker: PhantomData,
    }
}

impl<F, I, O> Transform<I, O> for FnTransform<F, I, O>
where
    F: Fn(I) -> Result<O> + Send + Sync,
{
    fn apply(&self, input: I) -> Result<O> {
        (self.f)(input)
    }
}

/// Runs a list of same-typed transforms in order. Used where the list is
/// only known at runtime (e.g. hooks assembled from configuration).
pub struct Sequential<T> {
    steps: Vec<Box<dyn Transform<T, T>>>,
}

impl<T> Default for Sequential<T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T> Sequential<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, step: impl Transform<T, T> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<T> Transform<T, T> for Sequential<T> {
    fn apply(&self, input: T) -> Result<T> {
        self.steps
            .iter()
            .enumerate()
            .try_fold(input, |value, (i, step)| {
                step.apply(value)
                    .with_context(|| format!("Sequential step {} failed", i))
            })
    }
}
