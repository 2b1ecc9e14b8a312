use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// An attempt that has been started and will resolve later.
pub type PendingFetch<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// An operation that may need several attempts.
///
/// [`begin_fetch`](RetryableSource::begin_fetch) must not block: it starts one attempt and
/// hands back a future for its outcome. A synchronous error means the attempt could not even
/// be started.
pub trait RetryableSource: Send {
    /// Value produced by a successful attempt.
    type Output: Send + 'static;
    /// Error produced by a failed attempt.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Starts one attempt.
    ///
    /// # Errors
    ///
    /// Returns the source error if the attempt could not be started.
    fn begin_fetch(&mut self) -> Result<PendingFetch<Self::Output, Self::Error>, Self::Error>;

    /// Called when the pending attempt was given up on (per-attempt timeout).
    ///
    /// Sources that correlate outcomes with attempts drop that correlation state here.
    fn abandon(&mut self) {}
}

/// [`RetryableSource`] built from a closure returning a future. See [`from_fn`].
pub struct FnSource<F, T, E> {
    make: F,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<F, T, E> std::fmt::Debug for FnSource<F, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

/// Wraps `make` into a [`RetryableSource`]; every attempt calls `make` once.
pub fn from_fn<F, Fut, T, E>(make: F) -> FnSource<F, T, E>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    FnSource {
        make,
        _marker: PhantomData,
    }
}

impl<F, Fut, T, E> RetryableSource for FnSource<F, T, E>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Output = T;
    type Error = E;

    fn begin_fetch(&mut self) -> Result<PendingFetch<T, E>, E> {
        Ok(Box::pin((self.make)()))
    }
}
