//! Shared cache: one owner per uuid across cooperating instances.
//!
//! Instances share a key-value store. For every cached uuid the store
//! carries `value.<uuid>` (the serialised last-known value) and
//! `owner.<uuid>` (the session id of the instance driving it). Within
//! an instance, one registered cell is promoted to *primary* and
//! actually computes; every other cell with the same uuid passively
//! mirrors. Ownership is claimed if absent, migrates when an owner
//! key disappears, and can be deferred to a parent frame for uuids
//! under the advertised prefix.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::cell::{CacheId, Cell};
use crate::frame::Port;
use crate::storage::Storage;
use crate::wire::{CacheUpdate, WireMessage};

thread_local! {
	static CURRENT: RefCell<Option<SharedCache>> = RefCell::new(None);
}

/// The ambient cache cache-identified cells initialise against.
pub(crate) fn current() -> Option<SharedCache> {
	CURRENT.with(|current| current.borrow().clone())
}

pub(crate) type WeakCache = Weak<CacheBody>;

fn value_key(uuid: &str) -> String {
	format!("value.{uuid}")
}

fn owner_key(uuid: &str) -> String {
	format!("owner.{uuid}")
}

fn session_id() -> String {
	let seed = ulid::Ulid::new().to_string();
	format!("{:08x}", fxhash::hash64(seed.as_bytes()) as u32)
}

/// What to do with a primary whose last local user went away.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColdPolicy {
	/// Keep the cold primary driving so reactivation is cheap.
	Retain,
	/// Finalise it immediately, relinquishing the owner key when no
	/// users remain.
	Finalize,
}

#[derive(Clone)]
pub struct SharedCache {
	body: Rc<CacheBody>,
}

pub(crate) struct CacheBody {
	session: String,
	storage: Rc<dyn Storage>,
	policy: ColdPolicy,
	regs: RefCell<BTreeMap<String, Registration>>,
	parent: RefCell<Option<ParentLink>>,
}

struct ParentLink {
	port: Rc<dyn Port>,
	prefix: String,
}

struct Registration {
	primary: Option<Cell>,
	users: Vec<Cell>,
	owned: bool,
	deferred: bool,
	cache_id: CacheId,
}

impl SharedCache {
	pub fn new(storage: Rc<dyn Storage>) -> Self {
		Self::with_policy(storage, ColdPolicy::Retain)
	}

	pub fn with_policy(storage: Rc<dyn Storage>, policy: ColdPolicy) -> Self {
		let body = Rc::new(CacheBody {
			session: session_id(),
			storage,
			policy,
			regs: RefCell::new(BTreeMap::new()),
			parent: RefCell::new(None),
		});
		let weak: Weak<CacheBody> = Rc::downgrade(&body);
		body.storage.watch(Box::new(move |key, new_value| {
			if let Some(body) = weak.upgrade() {
				body.on_storage(key, new_value);
			}
		}));
		SharedCache { body }
	}

	pub fn session(&self) -> String {
		self.body.session.clone()
	}

	/// Makes this cache the ambient one for the current thread.
	pub fn install(&self) {
		CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
	}

	pub fn uninstall() {
		CURRENT.with(|current| current.borrow_mut().take());
	}

	/// Instance teardown: deferred uuids are dropped at the parent,
	/// owned uuids release their owner key so a peer can adopt them.
	pub fn unload(&self) {
		self.body.unload();
	}

	pub(crate) fn downgrade(&self) -> WeakCache {
		Rc::downgrade(&self.body)
	}

	pub(crate) fn upgrade(weak: &WeakCache) -> Option<SharedCache> {
		weak.upgrade().map(|body| SharedCache { body })
	}

	pub(crate) fn init(&self, id: &CacheId, cell: &Cell) {
		self.body.init(id, cell);
	}

	pub(crate) fn finalize(&self, id: &CacheId, cell: &Cell) {
		self.body.finalize(id, cell);
	}

	pub(crate) fn published(&self, cell: &Cell, id: &CacheId, value: Option<&Value>) {
		self.body.published(cell, id, value);
	}

	pub(crate) fn adopt_parent(&self, port: Rc<dyn Port>, prefix: String) {
		self.body.adopt_parent(port, prefix);
	}

	pub(crate) fn remote_update(&self, update: &CacheUpdate) {
		self.body.remote_update(update);
	}

	pub(crate) fn remote_unknown(&self, uuid: &str) {
		self.body.remote_unknown(uuid);
	}
}

enum InitTail {
	Fresh,
	Reactivated,
	Mirror(Option<Value>),
}

impl CacheBody {
	fn init(&self, id: &CacheId, cell: &Cell) {
		let uuid = id.uuid.clone();
		let tail = {
			let mut regs = self.regs.borrow_mut();
			match regs.get_mut(&uuid) {
				None => {
					regs.insert(
						uuid.clone(),
						Registration {
							primary: None,
							users: vec![cell.clone()],
							owned: false,
							deferred: false,
							cache_id: id.clone(),
						},
					);
					InitTail::Fresh
				}
				Some(reg) if reg.primary.as_ref() == Some(cell) => {
					// A cold primary coming back: just re-flag.
					reg.owned = true;
					InitTail::Reactivated
				}
				Some(reg) => {
					let source = reg
						.primary
						.iter()
						.chain(reg.users.first())
						.find_map(|peer| peer.get());
					reg.users.push(cell.clone());
					InitTail::Mirror(source)
				}
			}
		};
		match tail {
			InitTail::Fresh => {
				if let Some(text) = self.storage.get(&value_key(&uuid)) {
					if let Some(value) = id.decode(&text) {
						cell.accept(Some(value));
					}
				}
				self.ensure_active(&uuid);
			}
			InitTail::Reactivated => {}
			InitTail::Mirror(Some(value)) => cell.accept(Some(value)),
			InitTail::Mirror(None) => {}
		}
	}

	fn ensure_active(&self, uuid: &str) {
		// A primary that lost its owned flag is finalised and demoted
		// back into the mirror set.
		let stale = {
			let mut regs = self.regs.borrow_mut();
			match regs.get_mut(uuid) {
				Some(reg) if !reg.users.is_empty() && reg.primary.is_some() && !reg.owned => {
					reg.primary.take()
				}
				_ => None,
			}
		};
		if let Some(primary) = stale {
			primary.deactivate_producer();
			if let Some(reg) = self.regs.borrow_mut().get_mut(uuid) {
				reg.users.push(primary);
			}
		}

		// A primary still driving without the owned flag (a lost
		// conflict, or a cold one) re-claims a free owner key.
		let reclaim = {
			let regs = self.regs.borrow();
			matches!(regs.get(uuid), Some(reg) if reg.primary.is_some() && !reg.owned)
		};
		if reclaim {
			let key = owner_key(uuid);
			if self.storage.get(&key).is_none() {
				self.storage.set(&key, &self.session);
				if let Some(reg) = self.regs.borrow_mut().get_mut(uuid) {
					reg.owned = true;
				}
			}
			return;
		}

		let needs_driver = {
			let regs = self.regs.borrow();
			match regs.get(uuid) {
				Some(reg) => !reg.users.is_empty() && reg.primary.is_none() && !reg.deferred,
				None => false,
			}
		};
		if !needs_driver {
			return;
		}

		// Uuids under the parent's prefix are computed by the parent.
		let defer = {
			let parent = self.parent.borrow();
			parent
				.as_ref()
				.filter(|link| !link.prefix.is_empty() && uuid.starts_with(&link.prefix))
				.map(|link| link.port.clone())
		};
		if let Some(port) = defer {
			if let Some(reg) = self.regs.borrow_mut().get_mut(uuid) {
				reg.deferred = true;
			}
			port.post(&WireMessage::Use(uuid.to_string()));
			return;
		}

		// Claim-if-absent owner election.
		let key = owner_key(uuid);
		let ours = match self.storage.get(&key) {
			None => {
				self.storage.set(&key, &self.session);
				true
			}
			Some(session) => session == self.session,
		};
		if !ours {
			// Passive mirror: storage events drive us from here.
			return;
		}

		let promoted = {
			let mut regs = self.regs.borrow_mut();
			match regs.get_mut(uuid) {
				Some(reg) if reg.primary.is_none() && !reg.users.is_empty() => {
					let cell = reg.users.remove(0);
					reg.primary = Some(cell.clone());
					reg.owned = true;
					Some(cell)
				}
				_ => None,
			}
		};
		if let Some(cell) = promoted {
			cell.activate_producer();
		}
	}

	/// Publication from a primary's trigger/reset. Only the storage
	/// owner writes; mirrors are fed through the no-publish path.
	fn published(&self, cell: &Cell, id: &CacheId, value: Option<&Value>) {
		let users = {
			let regs = self.regs.borrow();
			let Some(reg) = regs.get(&id.uuid) else { return };
			if reg.primary.as_ref() != Some(cell) {
				return;
			}
			reg.users.clone()
		};
		if self.storage.get(&owner_key(&id.uuid)).as_deref() != Some(self.session.as_str()) {
			tracing::debug!(uuid = %id.uuid, "publish skipped, not the storage owner");
			return;
		}
		match value {
			Some(value) => {
				self.storage.set(&value_key(&id.uuid), &id.encode(value));
				for user in users {
					user.accept(Some(value.clone()));
				}
			}
			None => {
				self.storage.remove(&value_key(&id.uuid));
				for user in users {
					user.accept(None);
				}
			}
		}
	}

	fn finalize(&self, id: &CacheId, cell: &Cell) {
		let uuid = id.uuid.clone();
		enum Tail {
			Nothing,
			Relinquish(Cell),
			Continue(Cell),
		}
		let mut post_drop: Option<Rc<dyn Port>> = None;
		let mut tail = Tail::Nothing;
		{
			let mut regs = self.regs.borrow_mut();
			let Some(reg) = regs.get_mut(&uuid) else {
				tracing::warn!(%uuid, "finalize for an unregistered uuid");
				return;
			};
			if reg.primary.as_ref() == Some(cell) {
				reg.owned = false;
				if self.policy == ColdPolicy::Finalize {
					reg.primary = None;
					tail = if reg.users.is_empty() {
						Tail::Relinquish(cell.clone())
					} else {
						Tail::Continue(cell.clone())
					};
				}
			} else {
				let before = reg.users.len();
				reg.users.retain(|user| user != cell);
				if reg.users.len() == before {
					tracing::warn!(%uuid, "finalize for an untracked cell");
				}
				if reg.users.is_empty() && reg.deferred {
					reg.deferred = false;
					post_drop = self.parent.borrow().as_ref().map(|link| link.port.clone());
				}
			}
			if reg.primary.is_none() && !reg.deferred && reg.users.is_empty() {
				regs.remove(&uuid);
			}
		}
		if let Some(port) = post_drop {
			port.post(&WireMessage::Drop(uuid.clone()));
		}
		match tail {
			Tail::Nothing => {}
			Tail::Relinquish(cell) => {
				cell.deactivate_producer();
				let key = owner_key(&uuid);
				if self.storage.get(&key).as_deref() == Some(self.session.as_str()) {
					self.storage.remove(&key);
				}
			}
			Tail::Continue(cell) => {
				cell.deactivate_producer();
				self.ensure_active(&uuid);
			}
		}
	}

	fn on_storage(&self, key: &str, new_value: Option<&str>) {
		if let Some(uuid) = key.strip_prefix("value.") {
			let found = {
				let regs = self.regs.borrow();
				regs.get(uuid).map(|reg| {
					let mut mirrors = reg.users.clone();
					if !reg.owned {
						if let Some(primary) = &reg.primary {
							mirrors.push(primary.clone());
						}
					}
					(mirrors, reg.cache_id.clone())
				})
			};
			let Some((mirrors, id)) = found else { return };
			match new_value {
				None => {
					for cell in mirrors {
						cell.accept(None);
					}
				}
				Some(text) => {
					if let Some(value) = id.decode(text) {
						for cell in mirrors {
							cell.accept(Some(value.clone()));
						}
					}
				}
			}
		} else if let Some(uuid) = key.strip_prefix("owner.") {
			match new_value {
				// A released owner key is an adoption opportunity.
				None => self.ensure_active(uuid),
				Some(other) if other != self.session => {
					let conflicted = {
						let mut regs = self.regs.borrow_mut();
						match regs.get_mut(uuid) {
							Some(reg) if reg.owned => {
								reg.owned = false;
								true
							}
							_ => false,
						}
					};
					if conflicted {
						tracing::warn!(%uuid, other, "ownership taken by another instance");
						self.ensure_active(uuid);
					}
				}
				Some(_) => {}
			}
		}
	}

	fn adopt_parent(&self, port: Rc<dyn Port>, prefix: String) {
		*self.parent.borrow_mut() = Some(ParentLink { port, prefix });
		let pending: Vec<String> = {
			self.regs
				.borrow()
				.iter()
				.filter(|(_, reg)| reg.primary.is_none() && !reg.deferred && !reg.users.is_empty())
				.map(|(uuid, _)| uuid.clone())
				.collect()
		};
		for uuid in pending {
			self.ensure_active(&uuid);
		}
	}

	fn remote_update(&self, update: &CacheUpdate) {
		let found = {
			let regs = self.regs.borrow();
			regs.get(&update.uuid).map(|reg| {
				let mut mirrors = reg.users.clone();
				if let Some(primary) = &reg.primary {
					mirrors.push(primary.clone());
				}
				(mirrors, reg.cache_id.clone())
			})
		};
		let Some((mirrors, id)) = found else {
			tracing::debug!(uuid = %update.uuid, "update for an unregistered uuid");
			return;
		};
		if update.value.is_none() && update.value_string.is_none() {
			for cell in mirrors {
				cell.accept(None);
			}
			return;
		}
		let value = match &update.value_string {
			Some(text) => id.decode(text),
			None => update.value.clone(),
		};
		if let Some(value) = value {
			for cell in mirrors {
				cell.accept(Some(value.clone()));
			}
		}
	}

	fn remote_unknown(&self, uuid: &str) {
		tracing::warn!(%uuid, "parent cannot resolve deferred uuid");
		let mirrors = {
			let regs = self.regs.borrow();
			regs.get(uuid).map(|reg| reg.users.clone()).unwrap_or_default()
		};
		for cell in mirrors {
			cell.accept(None);
		}
	}

	fn unload(&self) {
		let (drops, keys) = {
			let regs = self.regs.borrow();
			let mut drops = Vec::new();
			let mut keys = Vec::new();
			for (uuid, reg) in regs.iter() {
				if reg.deferred {
					drops.push(uuid.clone());
				} else {
					keys.push(owner_key(uuid));
				}
			}
			(drops, keys)
		};
		let parent = self.parent.borrow().as_ref().map(|link| link.port.clone());
		if let Some(port) = parent {
			for uuid in drops {
				port.post(&WireMessage::Drop(uuid));
			}
		}
		for key in keys {
			if self.storage.get(&key).as_deref() == Some(self.session.as_str()) {
				self.storage.remove(&key);
			}
		}
	}
}
