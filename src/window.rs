//! Batch windows: the span of time during which a batch accepts new keys.
//!
//! A window is opened when a batch receives its first key, and is driven by
//! polling the batch's driving future. When it completes, the batch is
//! dispatched.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_timer::Delay;

/// Something that can open a new batch window.
pub trait Window {
    type Delay: Future<Output = ()>;

    fn open(&self) -> Self::Delay;
}

/// Any function returning a future can serve as a window; this is the most
/// flexible option, e.g. `|| Delay::new(Duration::from_millis(5))`.
impl<F, D> Window for F
where
    F: Fn() -> D,
    D: Future<Output = ()>,
{
    type Delay = D;

    fn open(&self) -> D {
        self()
    }
}

impl Window for Duration {
    type Delay = Delay;

    fn open(&self) -> Delay {
        Delay::new(*self)
    }
}

/// The standard windows used by the entity loaders, selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchWindow {
    /// Close on the driving future's next poll after it has yielded to the
    /// executor once. Every sibling future polled in between (for instance
    /// by `join_all` over a list of field resolvers) joins the batch.
    Tick,

    /// Close after a fixed delay.
    Delay(Duration),

    /// Never close on its own. The batch is dispatched by an explicit
    /// `dispatch()`, or when it reaches its key limit.
    Manual,
}

impl Default for BatchWindow {
    fn default() -> Self {
        BatchWindow::Tick
    }
}

impl Window for BatchWindow {
    type Delay = WindowDelay;

    fn open(&self) -> WindowDelay {
        match *self {
            BatchWindow::Tick => WindowDelay::Tick { yielded: false },
            BatchWindow::Delay(duration) => WindowDelay::Timer(Delay::new(duration)),
            BatchWindow::Manual => WindowDelay::Manual,
        }
    }
}

/// The future for an open [`BatchWindow`].
#[derive(Debug)]
pub enum WindowDelay {
    Tick { yielded: bool },
    Timer(Delay),
    Manual,
}

impl Future for WindowDelay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        match self.get_mut() {
            WindowDelay::Tick { yielded: true } => Poll::Ready(()),
            WindowDelay::Tick { yielded } => {
                *yielded = true;
                ctx.waker().wake_by_ref();
                Poll::Pending
            }
            WindowDelay::Timer(delay) => Pin::new(delay).poll(ctx),
            WindowDelay::Manual => Poll::Pending,
        }
    }
}
