use futures::{FutureExt, Stream};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{sleep, Sleep};

use crate::ProducerOptions;

/// Upper bound of a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A stream that yields exponentially increasing reconnect delays, capped at
/// [`MAX_BACKOFF`]. Each item is yielded once its delay has elapsed.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    /// Delays yielded so far.
    attempts: usize,
    /// Number of delays to yield before ending the stream. `None` never ends.
    max_attempts: Option<usize>,
    /// The delay currently being waited on.
    delay: Duration,
    /// The pending timer. Boxed because `Sleep` is not `Unpin`.
    timer: Option<Pin<Box<Sleep>>>,
}

impl ExponentialBackoff {
    pub(crate) fn new(initial: Duration, max_attempts: Option<usize>) -> Self {
        Self { attempts: 0, max_attempts, delay: initial.min(MAX_BACKOFF), timer: None }
    }
}

impl From<&ProducerOptions> for ExponentialBackoff {
    fn from(options: &ProducerOptions) -> Self {
        Self::new(options.retry_backoff, options.reconnect_attempts)
    }
}

impl Stream for ExponentialBackoff {
    type Item = Duration;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.max_attempts.is_some_and(|max| this.attempts >= max) {
            return Poll::Ready(None);
        }

        let timer = this.timer.get_or_insert_with(|| Box::pin(sleep(this.delay)));
        if timer.poll_unpin(cx).is_pending() {
            return Poll::Pending;
        }

        let elapsed = this.delay;
        this.attempts += 1;
        this.delay = (this.delay * 2).min(MAX_BACKOFF);
        this.timer = None;

        Poll::Ready(Some(elapsed))
    }
}
