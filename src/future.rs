// Future: single-assignment values with continuations
//
// A Future<T> is the read side and a Promise<T> the write side of one shared
// cell. The cell is either Pending (holding the continuations registered so
// far) or Ready (holding the outcome). Fulfilment is single-shot: the first
// `set` wins and later ones are ignored, which is how "first failure wins"
// combinators are built.
//
// Continuations run synchronously on the thread that fulfils the promise,
// after the cell lock is released. Nothing here ever blocks a worker except
// `Future::get`, which is meant for top-level callers only.
//
// AsyncMutex serialises asynchronous sections: a queued section starts when
// the previous section's future resolves, not when a thread wakes up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::EvalError;

/// What a future resolves to.
pub type Outcome<T> = Result<T, EvalError>;

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Ready(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Read side of an asynchronous value.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// Write side of an asynchronous value. Cloneable; the first `set` wins.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = matches!(*self.shared.state.lock(), State::Ready(_));
        f.debug_struct("Future").field("ready", &ready).finish()
    }
}

/// A connected promise/future pair.
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(Vec::new())),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Future { shared },
    )
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Fulfil the promise. Returns false if it was already fulfilled, in
    /// which case `outcome` is dropped.
    pub fn set(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Ready(_) => return false,
                State::Pending(waiting) => {
                    let waiting = std::mem::take(waiting);
                    *state = State::Ready(outcome.clone());
                    waiting
                }
            }
        };
        self.shared.ready.notify_all();
        for continuation in continuations {
            continuation(&outcome);
        }
        true
    }

    pub fn set_value(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    pub fn set_error(&self, error: EvalError) -> bool {
        self.set(Err(error))
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    pub fn ready(value: T) -> Self {
        Self::from_outcome(Ok(value))
    }

    pub fn failed(error: EvalError) -> Self {
        Self::from_outcome(Err(error))
    }

    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Ready(outcome)),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Ready(_))
    }

    /// The outcome if already available.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        match &*self.shared.state.lock() {
            State::Ready(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Block the calling thread until the outcome is available. Only for
    /// top-level callers; never call this from a pool worker.
    pub fn get(&self) -> Outcome<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let State::Ready(outcome) = &*state {
                return outcome.clone();
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Run `f` with the outcome once it is available: immediately if the
    /// future is ready, otherwise on the fulfilling thread.
    pub fn on_ready(&self, f: impl FnOnce(Outcome<T>) + Send + 'static) {
        let ready = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Ready(outcome) => outcome.clone(),
                State::Pending(waiting) => {
                    waiting.push(Box::new(move |outcome: &Outcome<T>| f(outcome.clone())));
                    return;
                }
            }
        };
        f(ready);
    }

    /// Register `f` if the outcome is still pending. A ready outcome is
    /// handed back instead and `f` is dropped uncalled, so a loop driving
    /// futures can carry on in place rather than recursing.
    pub fn defer(&self, f: impl FnOnce(Outcome<T>) + Send + 'static) -> Option<Outcome<T>> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Ready(outcome) => Some(outcome.clone()),
            State::Pending(waiting) => {
                waiting.push(Box::new(move |outcome: &Outcome<T>| f(outcome.clone())));
                None
            }
        }
    }

    /// Fulfil `promise` with this future's outcome.
    pub fn forward(&self, promise: Promise<T>) {
        self.on_ready(move |outcome| {
            promise.set(outcome);
        });
    }

    /// Chain an asynchronous step on success; errors pass through.
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        self.then_outcome(move |outcome| match outcome {
            Ok(value) => f(value),
            Err(e) => Future::failed(e),
        })
    }

    /// Chain an asynchronous step that also sees failures.
    pub fn then_outcome<U, F>(self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> Future<U> + Send + 'static,
    {
        if let Some(outcome) = self.try_get() {
            return f(outcome);
        }
        let (promise, future) = channel();
        self.on_ready(move |outcome| f(outcome).forward(promise));
        future
    }

    /// Chain a synchronous step on success.
    pub fn map<U, F>(self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        self.then(move |value| Future::from_outcome(f(value)))
    }

    /// Rewrite the error of a failed future.
    pub fn map_err<F>(self, f: F) -> Future<T>
    where
        F: FnOnce(EvalError) -> EvalError + Send + 'static,
    {
        self.then_outcome(move |outcome| Future::from_outcome(outcome.map_err(f)))
    }
}

/// Join: resolves to all values in order once every future succeeded, or to
/// the first failure observed.
pub fn when_all<T: Clone + Send + 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    let ready: Option<Vec<Outcome<T>>> = futures.iter().map(Future::try_get).collect();
    if let Some(outcomes) = ready {
        return Future::from_outcome(outcomes.into_iter().collect());
    }

    struct Join<T> {
        slots: Vec<Option<T>>,
        remaining: usize,
    }

    let (promise, joined) = channel();
    let join = Arc::new(Mutex::new(Join {
        slots: vec![None; futures.len()],
        remaining: futures.len(),
    }));
    for (i, future) in futures.into_iter().enumerate() {
        let join = Arc::clone(&join);
        let promise = promise.clone();
        future.on_ready(move |outcome| match outcome {
            Err(e) => {
                promise.set_error(e);
            }
            Ok(value) => {
                let done = {
                    let mut join = join.lock();
                    join.slots[i] = Some(value);
                    join.remaining -= 1;
                    if join.remaining == 0 {
                        Some(join.slots.drain(..).flatten().collect())
                    } else {
                        None
                    }
                };
                if let Some(values) = done {
                    promise.set_value(values);
                }
            }
        });
    }
    joined
}

type Section = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MutexState {
    locked: bool,
    queue: VecDeque<Section>,
}

/// FIFO lock over asynchronous sections.
#[derive(Default)]
pub struct AsyncMutex {
    state: Mutex<MutexState>,
}

impl fmt::Debug for AsyncMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncMutex")
            .field("locked", &state.locked)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `section` once every earlier section has resolved. The lock is
    /// held until the future returned by `section` resolves.
    pub fn run<T, F>(self: &Arc<Self>, section: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Future<T> + Send + 'static,
    {
        let (promise, result) = channel();
        let this = Arc::clone(self);
        let start: Section = Box::new(move || {
            section().on_ready(move |outcome| {
                promise.set(outcome);
                this.release();
            });
        });
        let start = {
            let mut state = self.state.lock();
            if state.locked {
                state.queue.push_back(start);
                None
            } else {
                state.locked = true;
                Some(start)
            }
        };
        if let Some(start) = start {
            start();
        }
        result
    }

    fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            let next = state.queue.pop_front();
            if next.is_none() {
                state.locked = false;
            }
            next
        };
        if let Some(next) = next {
            next();
        }
    }
}
