use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;

use crate::{
    data::{KeySet, Token as KeyToken, ValueSet},
    wakerset::{Token as WakerToken, WakerSet},
    window::Window,
};

/// A batch function: takes every key collected during one window and
/// produces a [`ValueSet`] with one result per key. Implemented for every
/// `Fn(KeySet<Key>) -> impl Future<Output = Result<ValueSet<V, E>, E>>`.
pub trait BatchFn<Key> {
    type Value;
    type Error;
    type Future: Future<Output = Result<ValueSet<Self::Value, Self::Error>, Self::Error>>;

    fn call(&self, keys: KeySet<Key>) -> Self::Future;
}

impl<Key, F, Fut, Value, Error> BatchFn<Key> for F
where
    F: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value, Error>, Error>>,
{
    type Value = Value;
    type Error = Error;
    type Future = Fut;

    fn call(&self, keys: KeySet<Key>) -> Fut {
        self(keys)
    }
}

/// The result of one batch, as stored in the shared state.
type BatchResult<Key, Batcher> =
    Result<ValueSet<<Batcher as BatchFn<Key>>::Value, <Batcher as BatchFn<Key>>::Error>, <Batcher as BatchFn<Key>>::Error>;

struct AccumulatingState<Key, Batcher, Delay> {
    keys: KeySet<Key>,
    batcher: Arc<Batcher>,

    // None means the window has been closed early (key limit or explicit
    // dispatch); the next poll dispatches and no new keys may be added.
    delay: Option<Pin<Box<Delay>>>,
    wakers: WakerSet,
}

impl<Key, Batcher, Delay> Debug for AccumulatingState<Key, Batcher, Delay>
where
    Key: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("batcher", &"<closure>")
            .field("delay", &self.delay.as_ref().map(|_| "<window>"))
            .field("wakers", &self.wakers)
            .finish()
    }
}

struct RunningState<Fut> {
    fut: Pin<Box<Fut>>,
    wakers: WakerSet,
    dropped_tokens: Vec<KeyToken>,
}

enum State<Key, Batcher: BatchFn<Key>, Delay> {
    Accum(AccumulatingState<Key, Batcher, Delay>),
    Running(RunningState<Batcher::Future>),
    Done(BatchResult<Key, Batcher>),
}

impl<Key, Batcher: BatchFn<Key>, Delay> State<Key, Batcher, Delay> {
    /// True if a new key may still join this batch.
    fn is_open(&self) -> bool {
        matches!(self, State::Accum(AccumulatingState { delay: Some(..), .. }))
    }
}

type SharedState<Key, Batcher, Delay> = Arc<Mutex<State<Key, Batcher, Delay>>>;

/// The configuration of a batcher: the batch function itself, the window
/// during which keys are collected, and an optional limit on batch size.
#[derive(Debug, Clone, Default)]
pub struct BatchRules<Batcher, W> {
    pub batcher: Batcher,
    pub window: W,
    pub max_keys: Option<NonZeroUsize>,
}

/// A BatchController is the entry point for creating [`BatchFuture`]s. It
/// maintains a "currently accumulating" batch, and each time you call
/// [`load`](BatchController::load), the key is added to that batch, until:
///
/// - the batch's window closes
/// - the batch reaches its `max_keys`
/// - [`dispatch`](BatchController::dispatch) is called
///
/// At this point the batch is detached from the controller and replaced with
/// a fresh one by the next `load`. The futures associated with the old batch
/// share ownership of it and drive it to completion, independent of the
/// controller.
pub struct BatchController<Key, Batcher: BatchFn<Key>, W: Window> {
    batcher: Arc<Batcher>,
    window: W,
    max_keys: Option<NonZeroUsize>,
    current: ArcSwapOption<Mutex<State<Key, Batcher, W::Delay>>>,
}

impl<Key, Batcher, W> Debug for BatchController<Key, Batcher, W>
where
    Batcher: BatchFn<Key>,
    W: Window,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchController")
            .field("batcher", &"<closure>")
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl<Key, Batcher, W> BatchController<Key, Batcher, W>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    W: Window,
{
    pub fn new(rules: BatchRules<Batcher, W>) -> Self {
        let BatchRules {
            batcher,
            window,
            max_keys,
        } = rules;

        Self {
            batcher: Arc::new(batcher),
            window,
            max_keys,
            current: ArcSwapOption::empty(),
        }
    }

    /// Request the value for a single key. The key joins the currently
    /// accumulating batch, or starts a new one if there is none. The returned
    /// future does nothing until polled.
    pub fn load(&self, key: Key) -> BatchFuture<Key, Batcher, W::Delay> {
        // The pointer to the accumulating batch is swapped without a lock. A
        // fresh batch is published empty; whoever publishes it then joins it
        // on the next pass, like any other caller. If another thread installs
        // a batch between our read and our swap, we go around again and join
        // theirs instead.
        loop {
            let current = self.current.load_full();

            if let Some(ref state_handle) = current {
                let mut guard = state_handle.lock().unwrap();
                if guard.is_open() {
                    if let State::Accum(ref mut state) = *guard {
                        let key_token = state.keys.add_key(key);

                        // If we've hit the key limit:
                        // - Clear the window
                        // - Wake the driver, if there is one, so it dispatches
                        // - Detach the batch from the controller
                        if let Some(max_keys) = self.max_keys {
                            if state.keys.len() >= max_keys.get() {
                                state.delay = None;
                                state.wakers.wake_driver();
                                drop(guard);
                                let _ = self.current.compare_and_swap(&current, None);
                            }
                        }

                        return BatchFuture {
                            key_token,
                            waker_token: None,
                            state: Some(Arc::clone(state_handle)),
                        };
                    }
                }
            }

            // A batch limited to a single key is full as soon as it exists,
            // so it is never published.
            if let Some(max_keys) = self.max_keys {
                if max_keys.get() <= 1 {
                    let mut keys = KeySet::new();
                    let key_token = keys.add_key(key);

                    return BatchFuture {
                        key_token,
                        waker_token: None,
                        state: Some(Arc::new(Mutex::new(State::Accum(AccumulatingState {
                            keys,
                            batcher: Arc::clone(&self.batcher),
                            delay: None,
                            wakers: WakerSet::default(),
                        })))),
                    };
                }
            }

            let fresh = Arc::new(Mutex::new(State::Accum(AccumulatingState {
                keys: KeySet::new(),
                batcher: Arc::clone(&self.batcher),
                delay: Some(Box::pin(self.window.open())),
                wakers: WakerSet::default(),
            })));

            let previous = self.current.compare_and_swap(&current, Some(fresh));
            if !same(&previous, &current) {
                tracing::trace!("lost the race to publish a batch; retrying");
            }
        }
    }

    /// Close the currently accumulating batch, so that it is dispatched as
    /// soon as one of its futures is polled. Loads made after this call start
    /// a new batch. This is the explicit phase boundary used with a
    /// [`Manual`](crate::BatchWindow::Manual) window, e.g. "resolve one level
    /// of the result tree, then dispatch every loader".
    pub fn dispatch(&self) {
        let current = self.current.swap(None);

        if let Some(state_handle) = current {
            let mut guard = state_handle.lock().unwrap();
            if let State::Accum(ref mut state) = *guard {
                state.delay = None;
                state.wakers.wake_driver();
            }
        }
    }
}

/// A future for the result of a single key, sharing its batch with every
/// other future created by the same [`BatchController`] during that batch's
/// window. It is created by [`BatchController::load`], and when awaited, it
/// waits along with the rest of its batch until the window has closed, then
/// executes the batch function and resolves to the result for its own key.
pub struct BatchFuture<Key, Batcher: BatchFn<Key>, Delay> {
    key_token: KeyToken,
    waker_token: Option<WakerToken>,
    state: Option<SharedState<Key, Batcher, Delay>>,
}

impl<Key, Batcher: BatchFn<Key>, Delay> Debug for BatchFuture<Key, Batcher, Delay> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFuture")
            .field("key_token", &self.key_token)
            .field("completed", &self.state.is_none())
            .finish()
    }
}

/// The outcome of one key's load, remembering whether the error (if any)
/// came from the batch function failing as a whole.
#[derive(Debug, Clone)]
pub(crate) struct Settled<Value, Error> {
    pub(crate) result: Result<Value, Error>,
    pub(crate) batch_failed: bool,
}

impl<Key, Batcher, Delay> BatchFuture<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    /// Resolve to a [`Settled`] instead of a bare result.
    pub(crate) fn settle(self) -> Settle<Key, Batcher, Delay> {
        Settle(self)
    }

    fn poll_settled(&mut self, ctx: &mut Context<'_>) -> Poll<Settled<Batcher::Value, Batcher::Error>> {
        // Note about this mutex: it is safe to use in an async context, because
        // the lock is released when poll returns (it isn't held between polls).
        let mut guard = self
            .state
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture")
            .lock()
            // This is where panic propagation happens. If a *different* call
            // to poll panicked while driving the batch, the mutex will be
            // poisoned, which ensures that other polls also panic.
            .unwrap();

        if let State::Accum(ref mut state) = *guard {
            if let Some(ref mut delay) = state.delay {
                // Only the driving future watches the window; everyone else
                // just waits to be told the results are ready.
                if !state.wakers.register(&mut self.waker_token, ctx.waker()) {
                    return Poll::Pending;
                }

                if delay.as_mut().poll(ctx).is_pending() {
                    return Poll::Pending;
                }
            }

            // Window is closed. Transition to the Running state; whoever
            // dispatches the batch drives the fetch.
            let mut wakers = mem::take(&mut state.wakers);
            wakers.claim_driver(&mut self.waker_token, ctx.waker());

            let keys = state.keys.take();
            tracing::trace!(keys = keys.len(), "dispatching batch");

            let fut = Box::pin(state.batcher.call(keys));

            *guard = State::Running(RunningState {
                fut,
                wakers,
                dropped_tokens: Vec::new(),
            });
        }

        if let State::Running(ref mut state) = *guard {
            if !state.wakers.register(&mut self.waker_token, ctx.waker()) {
                return Poll::Pending;
            }

            let mut result = match state.fut.as_mut().poll(ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };

            // Some futures may have lost interest while we were in the Running
            // state. Remove those tokens from the ValueSet.
            if let Ok(values) = &mut result {
                state
                    .dropped_tokens
                    .iter()
                    .for_each(|token| values.discard(token));
            }

            // Now that we have a result, signal all the waiting futures to
            // wake up so they can get their results. We're about to grab our
            // own result, so we don't need to wake ourself.
            let wakers = mem::take(&mut state.wakers);
            match self.waker_token.take() {
                Some(token) => wakers.discard_wake_all(token),
                None => wakers.wake_all(),
            }

            *guard = State::Done(result);
        }

        let output = match *guard {
            State::Done(Ok(ref mut values)) => Settled {
                result: values
                    .take(&self.key_token)
                    .expect("Unknown logic error: no value in ValueSet associated with Token"),
                batch_failed: false,
            },
            State::Done(Err(ref err)) => Settled {
                result: Err(err.clone()),
                batch_failed: true,
            },
            _ => unreachable!("BatchFuture contained invalid state"),
        };

        drop(guard);
        self.state = None;
        Poll::Ready(output)
    }
}

impl<Key, Batcher, Delay> Future for BatchFuture<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    type Output = Result<Batcher::Value, Batcher::Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::into_inner(self)
            .poll_settled(ctx)
            .map(|settled| settled.result)
    }
}

/// A [`BatchFuture`] that resolves to a [`Settled`]. This is what a memoizing
/// loader shares between the handles of one key.
pub(crate) struct Settle<Key, Batcher: BatchFn<Key>, Delay>(BatchFuture<Key, Batcher, Delay>);

impl<Key, Batcher, Delay> Future for Settle<Key, Batcher, Delay>
where
    Batcher: BatchFn<Key>,
    Batcher::Error: Clone,
    Delay: Future<Output = ()>,
{
    type Output = Settled<Batcher::Value, Batcher::Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::into_inner(self).0.poll_settled(ctx)
    }
}

impl<Key, Batcher: BatchFn<Key>, Delay> Drop for BatchFuture<Key, Batcher, Delay> {
    fn drop(&mut self) {
        // The shared batch is only ever being driven by a single task.
        // Therefore, we have to ensure that another task is awoken to "take
        // over", in case this one was the driver. This logic is mostly handled
        // by the WakerSet type.
        //
        // We don't do any cleanup if the mutex is poisoned; the crate requires
        // panic=abort, meaning mutex poisoning shouldn't be possible.
        if let Some(state) = self.state.take() {
            if let Ok(mut guard) = state.lock() {
                match *guard {
                    State::Accum(ref mut state) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            state.wakers.discard_and_wake(waker_token);
                        }

                        state.keys.discard_token(&self.key_token);
                    }
                    State::Running(ref mut state) => {
                        if let Some(waker_token) = self.waker_token.take() {
                            state.wakers.discard_and_wake(waker_token);
                        }

                        // The KeySet is frozen (owned by the executing
                        // future). Remember our token so that it can be
                        // discarded from the ValueSet when it's ready.
                        state.dropped_tokens.push(self.key_token.duplicate());
                    }
                    State::Done(Ok(ref mut values)) => {
                        values.discard(&self.key_token);
                    }
                    State::Done(Err(..)) => {}
                }
            }
        }
    }
}
