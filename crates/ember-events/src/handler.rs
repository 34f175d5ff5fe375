//! Handler capability and calling-convention normalisation.
//!
//! Handlers may be written as plain functions or as async closures. Both are
//! turned into an `Arc<dyn EventHandler>` when they are registered, so the
//! dispatcher only ever awaits a single boxed future.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EventResult;
use crate::event::Event;

/// Something that reacts to dispatched events.
///
/// `Ok(true)` means the handler processed the event, `Ok(false)` is a
/// deliberate negative outcome, and `Err` signals a (possibly transient)
/// failure eligible for retry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: &Arc<Event>) -> EventResult<bool>;
}

/// Shared handle to a registered handler.
pub type Handler = Arc<dyn EventHandler>;

/// Adapter for synchronous handler functions.
pub struct SyncFnHandler<F> {
    func: F,
}

#[async_trait]
impl<F> EventHandler for SyncFnHandler<F>
where
    F: Fn(&Event) -> EventResult<bool> + Send + Sync,
{
    async fn handle(&self, event: &Arc<Event>) -> EventResult<bool> {
        (self.func)(&**event)
    }
}

/// Adapter for async handler closures.
pub struct AsyncFnHandler<F, Fut> {
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = EventResult<bool>> + Send,
{
    async fn handle(&self, event: &Arc<Event>) -> EventResult<bool> {
        (self.func)(Arc::clone(event)).await
    }
}

/// Wrap a synchronous function as a handler.
///
/// ```rust
/// use ember_events::handler_fn;
///
/// let echo = handler_fn(|event| Ok(event.event_type().starts_with("test.")));
/// # let _ = echo;
/// ```
pub fn handler_fn<F>(func: F) -> Handler
where
    F: Fn(&Event) -> EventResult<bool> + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler { func })
}

/// Wrap an async closure as a handler.
///
/// ```rust
/// use ember_events::async_handler_fn;
///
/// let slow = async_handler_fn(|event| async move {
///     tokio::task::yield_now().await;
///     Ok(!event.payload().is_empty())
/// });
/// # let _ = slow;
/// ```
pub fn async_handler_fn<F, Fut>(func: F) -> Handler
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EventResult<bool>> + Send + 'static,
{
    Arc::new(AsyncFnHandler {
        func,
        _future: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventError;

    #[tokio::test]
    async fn test_sync_handler() {
        let handler = handler_fn(|event| Ok(event.event_type() == "a.b"));
        let hit = Arc::new(Event::new("a.b", "tests"));
        let miss = Arc::new(Event::new("a.c", "tests"));

        assert!(handler.handle(&hit).await.unwrap());
        assert!(!handler.handle(&miss).await.unwrap());
    }

    #[tokio::test]
    async fn test_async_handler() {
        let handler = async_handler_fn(|event| async move {
            tokio::task::yield_now().await;
            if event.payload().is_empty() {
                Err(EventError::handler("empty payload"))
            } else {
                Ok(true)
            }
        });

        let empty = Arc::new(Event::new("a", "tests"));
        let full = Arc::new(Event::new("a", "tests").with_field("k", "v"));

        assert_eq!(
            handler.handle(&empty).await,
            Err(EventError::handler("empty payload"))
        );
        assert!(handler.handle(&full).await.unwrap());
    }

    #[tokio::test]
    async fn test_trait_impl_handler() {
        struct Counter(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl EventHandler for Counter {
            async fn handle(&self, _event: &Arc<Event>) -> EventResult<bool> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(true)
            }
        }

        let counter = Arc::new(Counter(std::sync::atomic::AtomicUsize::new(0)));
        let handler: Handler = counter.clone();
        let event = Arc::new(Event::new("a", "tests"));
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
