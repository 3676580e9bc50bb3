use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::FutureExt;
use pin_project_lite::pin_project;
use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::error::{MirrorError, MirrorResult};

pin_project! {
    /// Future adapter that gracefully handles optional inner futures.
    ///
    /// This future resolves to the inner future output when provided,
    /// and remains pending indefinitely if the inner future is absent.
    #[derive(Debug)]
    pub struct OptionalFuture<F> {
        #[pin]
        inner: Option<F>,
    }
}

impl<F> OptionalFuture<F> {
    /// Creates a new [`OptionalFuture`] wrapping the given `inner` future.
    pub const fn new(inner: Option<F>) -> Self {
        Self { inner }
    }
}

impl<F> Future for OptionalFuture<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.as_mut().as_pin_mut() {
            Some(inner) => inner.poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Helper for constructing an [`OptionalFuture`] without naming the type.
#[inline]
pub fn optional_future<F>(inner: Option<F>) -> OptionalFuture<F> {
    OptionalFuture::new(inner)
}

/// Callbacks invoked when a future run through [`reactive`] finishes.
///
/// Exactly one callback is invoked per run.
pub trait ReactiveFutureCallback<I, E> {
    fn on_complete(&mut self, id: I) -> impl Future<Output = ()> + Send;

    fn on_error(&mut self, id: I, error: E) -> impl Future<Output = ()> + Send;

    fn on_panic(&mut self, id: I, panic: String) -> impl Future<Output = ()> + Send;
}

/// Runs `future` and reports its outcome for `id` to `callback`.
///
/// A panic of `future` is caught and reported through
/// [`ReactiveFutureCallback::on_panic`], the returned result then carries `on_panic_error`.
pub async fn reactive<I, F, C>(
    id: I,
    future: F,
    mut callback: C,
    on_panic_error: impl FnOnce(&str) -> MirrorError,
) -> MirrorResult<()>
where
    F: Future<Output = MirrorResult<()>>,
    C: ReactiveFutureCallback<I, MirrorError>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {
            callback.on_complete(id).await;
            Ok(())
        }
        Ok(Err(err)) => {
            callback.on_error(id, err.clone()).await;
            Err(err)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            callback.on_panic(id, message.clone()).await;
            Err(on_panic_error(&message))
        }
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
