//! Parent↔child frame proxy.
//!
//! A child runtime that cannot own certain uuids asks its parent to
//! own and compute them. The parent multiplexes any number of
//! children over the wire messages in [`crate::wire`], posting value
//! updates whenever the backing cell transitions.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::cache::SharedCache;
use crate::cell::{Cell, Token};
use crate::wire::{CacheUpdate, ProxyInfo, UnknownUuid, WireMessage};

/// Outbound half of a message channel.
pub trait Port {
	fn post(&self, message: &WireMessage);
}

/// A peer frame as seen from the parent side.
pub trait Frame: Port {
	fn id(&self) -> u64;
	/// Whether the sender is a direct child of this window.
	fn is_child(&self) -> bool;
}

/// Maps a uuid to the producer cell that computes it.
pub type Resolver = Rc<dyn Fn(&str) -> Option<Cell>>;

/// Parent-side multiplexer serving `useSpook`/`dropSpook` requests.
pub struct FrameProxy {
	body: Rc<ProxyBody>,
}

struct ProxyBody {
	resolve: Resolver,
	defer_prefix: String,
	entries: RefCell<BTreeMap<String, Entry>>,
	this: Weak<ProxyBody>,
}

struct Entry {
	cell: Cell,
	sources: Vec<Rc<dyn Frame>>,
	token: Token,
}

impl FrameProxy {
	pub fn new(defer_prefix: impl Into<String>, resolve: Resolver) -> Self {
		FrameProxy {
			body: Rc::new_cyclic(|this| ProxyBody {
				resolve,
				defer_prefix: defer_prefix.into(),
				entries: RefCell::new(BTreeMap::new()),
				this: this.clone(),
			}),
		}
	}

	/// Handles one inbound message. Messages from windows that are
	/// not direct children are ignored.
	pub fn receive(&self, from: &Rc<dyn Frame>, message: WireMessage) {
		if !from.is_child() {
			tracing::warn!(sender = from.id(), "message from a non-child window ignored");
			return;
		}
		match message {
			WireMessage::Hello(_) => from.post(&WireMessage::ProxyInfo(ProxyInfo {
				defer_parent_prefix: self.body.defer_prefix.clone(),
			})),
			WireMessage::Use(uuid) => self.body.use_spook(from, uuid),
			WireMessage::Drop(uuid) => self.body.drop_spook(from, &uuid),
			other => tracing::debug!(?other, "unexpected message from child"),
		}
	}
}

impl ProxyBody {
	fn use_spook(&self, from: &Rc<dyn Frame>, uuid: String) {
		let known = self.entries.borrow().contains_key(&uuid);
		if !known {
			let Some(cell) = (self.resolve)(&uuid) else {
				from.post(&WireMessage::Unknown(UnknownUuid { uuid }));
				return;
			};
			let this = self.this.clone();
			let watched = uuid.clone();
			let token = cell.notify(move || {
				if let Some(body) = this.upgrade() {
					body.broadcast(&watched);
				}
			});
			self.entries.borrow_mut().insert(
				uuid.clone(),
				Entry { cell, sources: Vec::new(), token },
			);
		}
		{
			let mut entries = self.entries.borrow_mut();
			if let Some(entry) = entries.get_mut(&uuid) {
				if !entry.sources.iter().any(|peer| peer.id() == from.id()) {
					entry.sources.push(from.clone());
				}
			}
		}
		// The requesting child gets the current state right away,
		// ready or not.
		if let Some(update) = self.update_for(&uuid) {
			from.post(&WireMessage::CacheUpdate(update));
		}
	}

	fn drop_spook(&self, from: &Rc<dyn Frame>, uuid: &str) {
		let removed = {
			let mut entries = self.entries.borrow_mut();
			let Some(entry) = entries.get_mut(uuid) else { return };
			entry.sources.retain(|peer| peer.id() != from.id());
			if entry.sources.is_empty() {
				entries.remove(uuid)
			} else {
				None
			}
		};
		if let Some(entry) = removed {
			entry.cell.unnotify(entry.token);
		}
	}

	fn broadcast(&self, uuid: &str) {
		let found = {
			let entries = self.entries.borrow();
			entries
				.get(uuid)
				.map(|entry| (build_update(uuid, &entry.cell), entry.sources.clone()))
		};
		let Some((update, sources)) = found else { return };
		for source in sources {
			source.post(&WireMessage::CacheUpdate(update.clone()));
		}
	}

	fn update_for(&self, uuid: &str) -> Option<CacheUpdate> {
		let entries = self.entries.borrow();
		entries.get(uuid).map(|entry| build_update(uuid, &entry.cell))
	}
}

// Serialised form for non-null objects when the cell carries a
// serialiser; the raw value otherwise; neither when not ready.
fn build_update(uuid: &str, cell: &Cell) -> CacheUpdate {
	let mut update = CacheUpdate {
		uuid: uuid.to_string(),
		value: None,
		value_string: None,
	};
	if let Some(value) = cell.get() {
		let serialize = cell.cache_id().and_then(|id| id.serialize);
		match serialize {
			Some(serialize) if value.is_object() => {
				update.value_string = Some(serialize(&value));
			}
			_ => update.value = Some(value),
		}
	}
	update
}

/// Child-side endpoint: handshakes with the parent proxy, adopts its
/// defer prefix into the local cache, and feeds value updates in.
pub struct FrameClient {
	parent: Rc<dyn Port>,
	cache: SharedCache,
}

impl FrameClient {
	pub fn new(parent: Rc<dyn Port>, cache: SharedCache) -> Self {
		FrameClient { parent, cache }
	}

	/// [`FrameClient::new`] followed by the handshake.
	pub fn connect(parent: Rc<dyn Port>, cache: SharedCache) -> Self {
		let client = Self::new(parent, cache);
		client.hello();
		client
	}

	/// (Re)sends the handshake; the parent answers with its defer
	/// prefix.
	pub fn hello(&self) {
		self.parent.post(&WireMessage::Hello(true));
	}

	pub fn receive(&self, message: WireMessage) {
		match message {
			WireMessage::ProxyInfo(info) => {
				self.cache.adopt_parent(self.parent.clone(), info.defer_parent_prefix);
			}
			WireMessage::CacheUpdate(update) => self.cache.remote_update(&update),
			WireMessage::Unknown(unknown) => self.cache.remote_unknown(&unknown.uuid),
			other => tracing::debug!(?other, "unexpected message from parent"),
		}
	}
}

/// Synchronous in-process frame, for tests and single-process
/// embedding. Records everything posted through it and optionally
/// delivers to a handler.
#[derive(Clone)]
pub struct MemoryFrame {
	body: Rc<MemoryFrameBody>,
}

struct MemoryFrameBody {
	id: u64,
	child: bool,
	deliver: RefCell<Option<Box<dyn Fn(WireMessage)>>>,
	sent: RefCell<Vec<WireMessage>>,
}

impl MemoryFrame {
	pub fn new(id: u64, child: bool) -> Self {
		MemoryFrame {
			body: Rc::new(MemoryFrameBody {
				id,
				child,
				deliver: RefCell::new(None),
				sent: RefCell::new(Vec::new()),
			}),
		}
	}

	pub fn on_message(&self, handler: impl Fn(WireMessage) + 'static) {
		*self.body.deliver.borrow_mut() = Some(Box::new(handler));
	}

	/// Everything posted through this frame, in order.
	pub fn sent(&self) -> Vec<WireMessage> {
		self.body.sent.borrow().clone()
	}
}

impl Port for MemoryFrame {
	fn post(&self, message: &WireMessage) {
		self.body.sent.borrow_mut().push(message.clone());
		let deliver = self.body.deliver.borrow();
		if let Some(handler) = deliver.as_ref() {
			handler(message.clone());
		}
	}
}

impl Frame for MemoryFrame {
	fn id(&self) -> u64 {
		self.body.id
	}

	fn is_child(&self) -> bool {
		self.body.child
	}
}
