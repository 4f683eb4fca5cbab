use std::cell::Cell as StdCell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use enclose::enclose;
use serde_json::Value;

use crate::canon::Hashed;

pub type DonePredicate = Rc<dyn Fn(&Value) -> bool>;
pub type SerializeFn = Rc<dyn Fn(&Value) -> String>;
pub type DeserializeFn = Rc<dyn Fn(&str) -> Option<Value>>;

thread_local! {
	static NEXT_ID: StdCell<u64> = StdCell::new(1);
	static NEXT_TOKEN: StdCell<u64> = StdCell::new(1);
	static CASCADE: StdCell<usize> = StdCell::new(0);
}

const CASCADE_LIMIT: usize = 64;

fn next_id() -> u64 {
	NEXT_ID.with(|n| {
		let id = n.get();
		n.set(id + 1);
		id
	})
}

fn next_token() -> Token {
	NEXT_TOKEN.with(|n| {
		let token = n.get();
		n.set(token + 1);
		Token(token)
	})
}

/// Opaque registration token. Tokens are allocated monotonically, so
/// observer maps keyed by token iterate in registration order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Token(u64);

/// Producer hook behind a cell: runs when the cell gains its first
/// user and, symmetrically, when it loses its last one.
pub trait Produce {
	fn activate(&self, cell: &Cell);
	fn deactivate(&self, cell: &Cell);
}

/// Identity under which a cell participates in the shared cache.
#[derive(Clone)]
pub struct CacheId {
	pub uuid: String,
	pub serialize: Option<SerializeFn>,
	pub deserialize: Option<DeserializeFn>,
}

impl CacheId {
	pub fn new(uuid: impl Into<String>) -> Self {
		CacheId {
			uuid: uuid.into(),
			serialize: None,
			deserialize: None,
		}
	}

	pub(crate) fn encode(&self, value: &Value) -> String {
		match &self.serialize {
			Some(f) => f(value),
			None => crate::canon::canon_string(value),
		}
	}

	pub(crate) fn decode(&self, text: &str) -> Option<Value> {
		match &self.deserialize {
			Some(f) => f(text),
			None => match serde_json::from_str(text) {
				Ok(value) => Some(value),
				Err(error) => {
					tracing::warn!(uuid = %self.uuid, %error, "cached value failed to parse");
					None
				}
			},
		}
	}
}

#[derive(Clone, Default)]
pub struct CellOptions {
	/// When false, a proposed null is indistinguishable from
	/// not-ready and resets the cell. Base cells default to false;
	/// derived cells opt in.
	pub may_be_null: bool,
	pub cache: Option<CacheId>,
	pub done: Option<DonePredicate>,
}

/// A single observable value slot: readiness, current value, change
/// and readiness observers, and a use-count driving lazy activation.
pub struct Cell {
	body: Rc<CellBody>,
}

impl Clone for Cell {
	fn clone(&self) -> Self {
		Self { body: self.body.clone() }
	}
}

impl PartialEq for Cell {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.body, &other.body)
	}
}

impl Eq for Cell {}

impl Debug for Cell {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.body.state.borrow();
		f.debug_struct("Cell")
			.field("id", &self.body.id)
			.field("ready", &state.ready)
			.field("users", &state.users)
			.finish()
	}
}

pub(crate) struct CellBody {
	id: u64,
	may_be_null: bool,
	cache: Option<CacheId>,
	done: Option<DonePredicate>,
	producer: Option<Rc<dyn Produce>>,
	state: RefCell<CellState>,
	observers: RefCell<Observers>,
	// The cache this cell initialised against, while it has users.
	bound: RefCell<Option<crate::cache::WeakCache>>,
	this: Weak<CellBody>,
}

struct CellState {
	ready: bool,
	value: Option<Hashed>,
	default: Option<Value>,
	triggering: bool,
	users: usize,
	generation: u64,
}

#[derive(Default)]
struct Observers {
	changed: BTreeMap<Token, Rc<dyn Fn(&Value)>>,
	readiness: BTreeMap<Token, Rc<dyn Fn()>>,
	thens: Vec<Box<dyn FnOnce(&Value)>>,
}

struct TriggerGuard {
	body: Rc<CellBody>,
}

impl Drop for TriggerGuard {
	fn drop(&mut self) {
		self.body.state.borrow_mut().triggering = false;
	}
}

struct CascadeGuard;

impl CascadeGuard {
	fn enter(id: u64) -> Self {
		CASCADE.with(|depth| {
			let next = depth.get() + 1;
			depth.set(next);
			if next == CASCADE_LIMIT {
				tracing::warn!(cell = id, depth = next, "trigger cascade reached diagnostic depth");
			}
		});
		CascadeGuard
	}
}

impl Drop for CascadeGuard {
	fn drop(&mut self) {
		CASCADE.with(|depth| depth.set(depth.get() - 1));
	}
}

impl Cell {
	pub fn new() -> Self {
		Self::with_options(CellOptions::default())
	}

	pub fn with_options(options: CellOptions) -> Self {
		Self::build(options, None)
	}

	pub(crate) fn with_producer(options: CellOptions, producer: Rc<dyn Produce>) -> Self {
		Self::build(options, Some(producer))
	}

	fn build(options: CellOptions, producer: Option<Rc<dyn Produce>>) -> Self {
		Cell {
			body: Rc::new_cyclic(|this| CellBody {
				id: next_id(),
				may_be_null: options.may_be_null,
				cache: options.cache,
				done: options.done,
				producer,
				state: RefCell::new(CellState {
					ready: false,
					value: None,
					default: None,
					triggering: false,
					users: 0,
					generation: 0,
				}),
				observers: RefCell::new(Observers::default()),
				bound: RefCell::new(None),
				this: this.clone(),
			}),
		}
	}

	pub fn id(&self) -> u64 {
		self.body.id
	}

	pub fn is_ready(&self) -> bool {
		self.body.state.borrow().ready
	}

	pub fn is_done(&self, value: &Value) -> bool {
		self.body.done.as_ref().map(|f| f(value)).unwrap_or(false)
	}

	/// The current value, present iff the cell is ready.
	pub fn get(&self) -> Option<Value> {
		let state = self.body.state.borrow();
		if state.ready {
			state.value.as_ref().map(|hashed| hashed.value.clone())
		} else {
			None
		}
	}

	pub fn users(&self) -> usize {
		self.body.state.borrow().users
	}

	pub fn downgrade(&self) -> WeakCell {
		WeakCell { body: self.body.this.clone() }
	}

	pub(crate) fn cache_id(&self) -> Option<CacheId> {
		self.body.cache.clone()
	}

	/// Registers interest. The first user initialises the cell: the
	/// shared cache takes over when a cache identity is configured
	/// and a cache is installed, otherwise the producer activates.
	pub fn retain(&self) {
		let first = {
			let mut state = self.body.state.borrow_mut();
			state.users += 1;
			state.users == 1
		};
		if first {
			self.initialise();
		}
	}

	/// Releases interest. The last release finalises symmetrically.
	/// Panics when called on a cell with no users.
	pub fn release(&self) {
		let last = {
			let mut state = self.body.state.borrow_mut();
			if state.users == 0 {
				panic!("release() on cell {} with no users", self.body.id);
			}
			state.users -= 1;
			state.users == 0
		};
		if last {
			self.finalise();
		}
	}

	fn initialise(&self) {
		if let Some(id) = &self.body.cache {
			if let Some(cache) = crate::cache::current() {
				*self.body.bound.borrow_mut() = Some(cache.downgrade());
				cache.init(id, self);
				return;
			}
		}
		self.activate_producer();
	}

	// The binding survives finalise: a cold-retained primary keeps
	// publishing through its cache until someone rebinds it.
	fn finalise(&self) {
		let bound = self.body.bound.borrow().clone();
		if let (Some(id), Some(weak)) = (&self.body.cache, &bound) {
			if let Some(cache) = crate::cache::SharedCache::upgrade(weak) {
				cache.finalize(id, self);
				return;
			}
		}
		self.deactivate_producer();
	}

	fn publish(&self, value: Option<&Value>) {
		let Some(id) = &self.body.cache else { return };
		let bound = self.body.bound.borrow().clone();
		if let Some(cache) = bound.as_ref().and_then(crate::cache::SharedCache::upgrade) {
			cache.published(self, id, value);
		}
	}

	pub(crate) fn activate_producer(&self) {
		if let Some(producer) = self.body.producer.clone() {
			producer.activate(self);
		}
	}

	pub(crate) fn deactivate_producer(&self) {
		if let Some(producer) = self.body.producer.clone() {
			producer.deactivate(self);
		}
	}

	/// Proposes a new value. `None` is the undefined sentinel and is
	/// ignored with a warning; null resets unless the cell allows
	/// nulls; values with an unchanged canonical form do not
	/// transition.
	pub fn changed(&self, value: Option<Value>) {
		self.changed_with(value, true);
	}

	/// Cache mirror path: same as [`Cell::changed`] but never
	/// publishes back to the shared cache.
	pub(crate) fn accept(&self, value: Option<Value>) {
		match value {
			Some(value) => self.changed_with(Some(value), false),
			None => self.reset_with(false),
		}
	}

	fn changed_with(&self, value: Option<Value>, publish: bool) {
		let Some(value) = value else {
			tracing::warn!(cell = self.body.id, "change to undefined ignored");
			return;
		};
		if value.is_null() && !self.body.may_be_null {
			self.reset_with(publish);
			return;
		}
		self.apply(Hashed::new(value), publish);
	}

	/// Applies `value` and propagates to observers. Canonically-equal
	/// proposals are absorbed; rejected with a warning while a trigger
	/// on this cell is already in progress.
	pub fn trigger(&self, value: Value) {
		self.apply(Hashed::new(value), true);
	}

	fn apply(&self, hashed: Hashed, publish: bool) {
		let value = hashed.value.clone();
		{
			let mut state = self.body.state.borrow_mut();
			if state.triggering {
				tracing::warn!(cell = self.body.id, "reentrant trigger ignored");
				return;
			}
			// Canonically-equal proposals are not transitions.
			if state.ready && state.value.as_ref().map(|current| current.hash) == Some(hashed.hash)
			{
				return;
			}
			state.triggering = true;
			state.ready = true;
			state.generation += 1;
			state.value = Some(hashed);
		}
		let trigger_guard = TriggerGuard { body: self.body.clone() };
		let cascade_guard = CascadeGuard::enter(self.body.id);

		let notifiers: Vec<Rc<dyn Fn()>> =
			self.body.observers.borrow().readiness.values().cloned().collect();
		for f in notifiers {
			f();
		}

		let subscribers: Vec<Rc<dyn Fn(&Value)>> =
			self.body.observers.borrow().changed.values().cloned().collect();
		for f in subscribers {
			f(&value);
		}

		let thens = std::mem::take(&mut self.body.observers.borrow_mut().thens);
		let drained = thens.len();
		for f in thens {
			f(&value);
		}

		drop(cascade_guard);
		drop(trigger_guard);

		for _ in 0..drained {
			self.release();
		}

		if publish {
			self.publish(Some(&value));
		}
	}

	/// Returns to not-ready, or to the configured default. Fires
	/// readiness-notifiers but never change-subscribers.
	pub fn reset(&self) {
		self.reset_with(true);
	}

	fn reset_with(&self, publish: bool) {
		let default = self.body.state.borrow().default.clone();
		if let Some(value) = default {
			self.apply(Hashed::new(value), publish);
			return;
		}
		{
			let mut state = self.body.state.borrow_mut();
			if state.triggering {
				tracing::warn!(cell = self.body.id, "reentrant reset ignored");
				return;
			}
			if !state.ready {
				return;
			}
			state.triggering = true;
			state.ready = false;
			state.value = None;
		}
		let trigger_guard = TriggerGuard { body: self.body.clone() };

		let notifiers: Vec<Rc<dyn Fn()>> =
			self.body.observers.borrow().readiness.values().cloned().collect();
		for f in notifiers {
			f();
		}

		drop(trigger_guard);

		if publish {
			self.publish(None);
		}
	}

	/// Configures a default that replaces any reset, making the cell
	/// always-ready from here on. Takes effect immediately when the
	/// cell is not ready.
	pub fn default_to(&self, value: Value) {
		let needs = {
			let mut state = self.body.state.borrow_mut();
			state.default = Some(value.clone());
			!state.ready
		};
		if needs {
			self.apply(Hashed::new(value), true);
		}
	}

	/// Registers a change-subscriber; implicit [`Cell::retain`].
	/// Invoked immediately when the cell is already ready.
	pub fn tie(&self, f: impl Fn(&Value) + 'static) -> Token {
		self.tie_at(next_token(), Rc::new(f))
	}

	fn tie_at(&self, token: Token, f: Rc<dyn Fn(&Value)>) -> Token {
		self.body.observers.borrow_mut().changed.insert(token, f.clone());
		let generation = self.body.state.borrow().generation;
		self.retain();
		// A producer that triggered during retain already delivered
		// through the trigger path; only call for a quiescent ready.
		let current = {
			let state = self.body.state.borrow();
			if state.ready && state.generation == generation {
				state.value.as_ref().map(|hashed| hashed.value.clone())
			} else {
				None
			}
		};
		if let Some(value) = current {
			f(&value);
		}
		token
	}

	pub fn untie(&self, token: Token) {
		let removed = self.body.observers.borrow_mut().changed.remove(&token).is_some();
		if removed {
			self.release();
		} else {
			tracing::warn!(cell = self.body.id, ?token, "untie of unknown subscriber");
		}
	}

	/// Registers a readiness-notifier; implicit [`Cell::retain`].
	/// Same immediacy rule as [`Cell::tie`].
	pub fn notify(&self, f: impl Fn() + 'static) -> Token {
		let token = next_token();
		let f: Rc<dyn Fn()> = Rc::new(f);
		self.body.observers.borrow_mut().readiness.insert(token, f.clone());
		let generation = self.body.state.borrow().generation;
		self.retain();
		let fire = {
			let state = self.body.state.borrow();
			state.ready && state.generation == generation
		};
		if fire {
			f();
		}
		token
	}

	pub fn unnotify(&self, token: Token) {
		let removed = self.body.observers.borrow_mut().readiness.remove(&token).is_some();
		if removed {
			self.release();
		} else {
			tracing::warn!(cell = self.body.id, ?token, "unnotify of unknown notifier");
		}
	}

	/// One-shot observer: runs on the next ready transition, or
	/// synchronously when the cell is already ready. Balances its own
	/// retain when it fires.
	pub fn then(&self, f: impl FnOnce(&Value) + 'static) {
		self.retain();
		let current = {
			let state = self.body.state.borrow();
			if state.ready {
				state.value.as_ref().map(|hashed| hashed.value.clone())
			} else {
				None
			}
		};
		match current {
			Some(value) => {
				f(&value);
				self.release();
			}
			None => self.body.observers.borrow_mut().thens.push(Box::new(f)),
		}
	}

	/// Like [`Cell::tie`], but unties itself after the first value the
	/// done predicate accepts. Panics when the cell has no predicate.
	pub fn done(&self, f: impl Fn(&Value) + 'static) -> Token {
		let Some(predicate) = self.body.done.clone() else {
			panic!("done() on cell {} which has no done predicate", self.body.id);
		};
		let token = next_token();
		let weak = self.downgrade();
		let wrapped: Rc<dyn Fn(&Value)> = Rc::new(move |value| {
			f(value);
			if predicate(value) {
				if let Some(cell) = weak.upgrade() {
					cell.untie(token);
				}
			}
		});
		self.tie_at(token, wrapped)
	}

	/// Debug tap: traces readiness and value transitions until the
	/// returned guard is dropped.
	pub fn log(&self, label: &str) -> LogGuard {
		let label: Rc<str> = label.into();
		let id = self.body.id;
		let weak = self.downgrade();
		let notify = self.notify(enclose!((label) move || {
			let ready = weak.upgrade().map(|cell| cell.is_ready()).unwrap_or(false);
			tracing::debug!(cell = id, label = %label, ready, "readiness");
		}));
		let tie = self.tie(enclose!((label) move |value| {
			tracing::debug!(cell = id, label = %label, %value, "value");
		}));
		LogGuard { cell: self.clone(), tie, notify }
	}
}

impl Default for Cell {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone)]
pub struct WeakCell {
	body: Weak<CellBody>,
}

impl WeakCell {
	pub fn upgrade(&self) -> Option<Cell> {
		self.body.upgrade().map(|body| Cell { body })
	}
}

/// Keeps a [`Cell::log`] tap registered; unties on drop.
pub struct LogGuard {
	cell: Cell,
	tie: Token,
	notify: Token,
}

impl Drop for LogGuard {
	fn drop(&mut self) {
		self.cell.untie(self.tie);
		self.cell.unnotify(self.notify);
	}
}
