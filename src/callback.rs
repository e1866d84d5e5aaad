//! User-supplied callbacks that may be either synchronous or asynchronous.
//!
//! Hooks like the room's message filter or a store's metadata callback are
//! modeled as a sum type and dispatched at a single call site, so callers
//! never inspect what a callback returned.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::error;

use crate::error::Error;

type BoxFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

/// A callback taking `T` and producing `R`, in either a blocking or an
/// awaitable flavor.
pub enum Callback<T, R> {
    Sync(Arc<dyn Fn(T) -> R + Send + Sync>),
    Async(Arc<dyn Fn(T) -> BoxFuture<R> + Send + Sync>),
}

impl<T, R> Clone for Callback<T, R> {
    fn clone(&self) -> Self {
        match self {
            Callback::Sync(f) => Callback::Sync(f.clone()),
            Callback::Async(f) => Callback::Async(f.clone()),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Callback<T, R> {
    /// Wrap a plain function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    /// Wrap an async function.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Callback::Async(Arc::new(move |arg| Box::pin(f(arg))))
    }

    /// Invoke the callback, awaiting only when it is asynchronous.
    pub async fn call(&self, arg: T) -> R {
        match self {
            Callback::Sync(f) => f(arg),
            Callback::Async(f) => f(arg).await,
        }
    }
}

/// Produces the metadata stored alongside each update.
pub type MetadataCallback = Callback<(), Vec<u8>>;

/// Filters inbound frames in [`crate::room::Room::serve`]; returning `true`
/// drops the frame.
pub type MessageFilter = Callback<Vec<u8>, bool>;

/// Decides whether an error raised inside a task scope was handled.
/// Returning `false` propagates the error and terminates the scope.
pub type ExceptionHandler = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// The default handler: re-raise everything.
pub fn default_exception_handler() -> ExceptionHandler {
    Arc::new(|_| false)
}

/// A handler that logs the error and discards it.
pub fn exception_logger() -> ExceptionHandler {
    Arc::new(|err| {
        error!(error = %err, "handled error");
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_and_async_flavors_dispatch_identically() {
        let sync: Callback<u32, u32> = Callback::sync(|n| n + 1);
        let async_cb: Callback<u32, u32> = Callback::async_fn(|n| async move { n + 1 });
        assert_eq!(sync.call(41).await, 42);
        assert_eq!(async_cb.call(41).await, 42);
    }

    #[test]
    fn default_handler_reraises() {
        let handler = default_exception_handler();
        assert!(!handler(&Error::ChannelOverflow));
    }
}
