//! A reactive value graph.
//!
//! Cells are observable value slots with readiness, reference-counted
//! interest, and producer hooks that acquire external resources only
//! while someone is watching. Transform cells recompute over
//! structured inputs exactly when those inputs change. A shared cache
//! elects one owner per uuid across cooperating instances over a
//! common key-value store, and a frame proxy lets a child runtime
//! delegate ownership of selected uuids to its parent.
//!
//! The graph is single-threaded cooperative: everything runs on one
//! logical thread, and the async pieces (timers, eventuals,
//! subscriptions) re-enter it through the tokio `LocalSet` driving
//! the process.

pub mod macros;

mod bridge;
mod cache;
mod canon;
mod cell;
mod error;
mod eventual;
mod fallback;
mod frame;
mod input;
mod interval;
mod latch;
mod probe;
mod reactive;
mod storage;
mod sub;
mod subscription;
mod transform;
mod wire;

use std::future::Future;

pub use cache::{ColdPolicy, SharedCache};
pub use cell::{
	CacheId, Cell, CellOptions, DeserializeFn, DonePredicate, LogGuard, Produce, SerializeFn,
	Token, WeakCell,
};
pub use error::{Error, Result};
pub use eventual::{Eventual, EventualHandle, Settled};
pub use frame::{Frame, FrameClient, FrameProxy, MemoryFrame, Port, Resolver};
pub use input::{Input, DEFAULT_DEPTH};
pub use interval::active_timers;
pub use storage::{FileStorage, MemoryStore, Storage, StoreHandle};
pub use subscription::{PushFn, Subscribe, Subscription};
pub use transform::{Outcome, TransformOptions};
pub use wire::{CacheUpdate, ProxyInfo, UnknownUuid, WireMessage};

/// Spawns graph-driving work on the current thread's local task set.
/// The process must drive the graph inside a `tokio::task::LocalSet`.
pub(crate) fn spawn(future: impl Future<Output = ()> + 'static) -> tokio::task::AbortHandle {
	tokio::task::spawn_local(future).abort_handle()
}
