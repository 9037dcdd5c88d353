//! Observable state cells shared by nets, rules, results and schedules
//!
//! An [`Observable`] holds the current state of a small state machine. Moves
//! the machine does not allow are ignored, so a state never moves back out of
//! a terminal value. Listeners run on the thread that performed the move,
//! after the cell's lock is released; they must not block.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

pub type ListenerId = u64;

pub type Listener<S> = Arc<dyn Fn(S) + Send + Sync>;

/// A state type with a fixed set of allowed moves
pub trait StateMachine: Copy + Eq + Debug + Send + Sync + 'static {
    fn is_terminal(&self) -> bool;

    /// Whether `self -> next` is a legal move
    fn can_move_to(&self, next: Self) -> bool;
}

struct Cell<S> {
    state: S,
    next_id: ListenerId,
    listeners: Vec<(ListenerId, Listener<S>)>,
}

pub struct Observable<S: StateMachine> {
    cell: Mutex<Cell<S>>,
    watch: watch::Sender<S>,
}

impl<S: StateMachine> Debug for Observable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable").field("state", &self.get()).finish()
    }
}

impl<S: StateMachine> Observable<S> {
    pub fn new(initial: S) -> Self {
        let (watch, _) = watch::channel(initial);
        Self {
            cell: Mutex::new(Cell {
                state: initial,
                next_id: 0,
                listeners: Vec::new(),
            }),
            watch,
        }
    }

    pub fn get(&self) -> S {
        self.cell.lock().state
    }

    /// Move to `next`; returns false when the move is not allowed or a no-op
    pub fn set(&self, next: S) -> bool {
        let listeners = {
            let mut cell = self.cell.lock();
            if cell.state == next || !cell.state.can_move_to(next) {
                return false;
            }
            cell.state = next;
            self.watch.send_replace(next);
            cell.listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect::<Vec<_>>()
        };
        for listener in listeners {
            listener(next);
        }
        true
    }

    /// Listen to future moves
    pub fn add_listener(&self, listener: impl Fn(S) + Send + Sync + 'static) -> ListenerId {
        self.add_shared_listener(Arc::new(listener), false)
    }

    /// Listen to future moves; if the state is already terminal the listener
    /// is called once with it before this returns
    pub fn add_listener_with_replay(&self, listener: impl Fn(S) + Send + Sync + 'static) -> ListenerId {
        self.add_shared_listener(Arc::new(listener), true)
    }

    pub fn add_shared_listener(&self, listener: Listener<S>, replay: bool) -> ListenerId {
        let (id, terminal) = {
            let mut cell = self.cell.lock();
            let id = cell.next_id;
            cell.next_id += 1;
            cell.listeners.push((id, listener.clone()));
            (id, cell.state.is_terminal().then_some(cell.state))
        };
        if let (true, Some(state)) = (replay, terminal) {
            listener(state);
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut cell = self.cell.lock();
        let before = cell.listeners.len();
        cell.listeners.retain(|(existing, _)| *existing != id);
        cell.listeners.len() != before
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.watch.subscribe()
    }

    /// Wait until the state satisfies `accept`
    pub async fn wait_for(&self, accept: impl FnMut(&S) -> bool) -> S {
        let mut receiver = self.watch.subscribe();
        let reached = match receiver.wait_for(accept).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| self.get())
    }

    pub async fn wait_terminal(&self) -> S {
        self.wait_for(|s| s.is_terminal()).await
    }
}
