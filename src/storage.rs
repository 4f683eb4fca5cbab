use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

/// Shared key-value store seam: get/set/remove by string key, plus a
/// subscription to change events raised by peer instances. Events
/// never echo the writing instance's own writes.
pub trait Storage {
	fn get(&self, key: &str) -> Option<String>;
	fn set(&self, key: &str, value: &str);
	fn remove(&self, key: &str);
	fn watch(&self, handler: Box<dyn Fn(&str, Option<&str>)>);
}

/// In-process store hub. Each [`MemoryStore::attach`] handle acts as
/// one instance (one tab); a write through one handle raises change
/// events on every other handle.
pub struct MemoryStore {
	inner: Rc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
	data: RefCell<BTreeMap<String, String>>,
	handles: RefCell<Vec<Weak<HandleInner>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		MemoryStore { inner: Rc::new(StoreInner::default()) }
	}

	pub fn attach(&self) -> StoreHandle {
		let handle = Rc::new(HandleInner {
			store: self.inner.clone(),
			watcher: RefCell::new(None),
		});
		self.inner.handles.borrow_mut().push(Rc::downgrade(&handle));
		StoreHandle { inner: handle }
	}

	/// Direct read, bypassing any handle.
	pub fn get(&self, key: &str) -> Option<String> {
		self.inner.data.borrow().get(key).cloned()
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

pub struct StoreHandle {
	inner: Rc<HandleInner>,
}

struct HandleInner {
	store: Rc<StoreInner>,
	watcher: RefCell<Option<Box<dyn Fn(&str, Option<&str>)>>>,
}

impl StoreInner {
	fn broadcast(&self, source: &Rc<HandleInner>, key: &str, new_value: Option<&str>) {
		self.handles.borrow_mut().retain(|handle| handle.strong_count() > 0);
		let peers: Vec<Rc<HandleInner>> =
			self.handles.borrow().iter().filter_map(Weak::upgrade).collect();
		for peer in peers {
			if Rc::ptr_eq(&peer, source) {
				continue;
			}
			let watcher = peer.watcher.borrow();
			if let Some(handler) = watcher.as_ref() {
				handler(key, new_value);
			}
		}
	}
}

impl Storage for StoreHandle {
	fn get(&self, key: &str) -> Option<String> {
		self.inner.store.data.borrow().get(key).cloned()
	}

	fn set(&self, key: &str, value: &str) {
		self.inner.store.data.borrow_mut().insert(key.to_string(), value.to_string());
		self.inner.store.broadcast(&self.inner, key, Some(value));
	}

	fn remove(&self, key: &str) {
		let removed = self.inner.store.data.borrow_mut().remove(key).is_some();
		if removed {
			self.inner.store.broadcast(&self.inner, key, None);
		}
	}

	fn watch(&self, handler: Box<dyn Fn(&str, Option<&str>)>) {
		*self.inner.watcher.borrow_mut() = Some(handler);
	}
}

/// One file per key under a base directory. Instance-local: there
/// are no cross-process change events.
pub struct FileStorage {
	base: PathBuf,
}

impl FileStorage {
	pub fn new(base: impl Into<PathBuf>) -> Self {
		FileStorage { base: base.into() }
	}

	fn path(&self, key: &str) -> PathBuf {
		self.base.join(key)
	}
}

impl Storage for FileStorage {
	fn get(&self, key: &str) -> Option<String> {
		std::fs::read_to_string(self.path(key)).ok()
	}

	fn set(&self, key: &str, value: &str) {
		let written = std::fs::create_dir_all(&self.base)
			.and_then(|_| std::fs::write(self.path(key), value));
		if let Err(error) = written {
			tracing::warn!(key, %error, "storage write failed");
		}
	}

	fn remove(&self, key: &str) {
		if let Err(error) = std::fs::remove_file(self.path(key)) {
			if error.kind() != std::io::ErrorKind::NotFound {
				tracing::warn!(key, %error, "storage remove failed");
			}
		}
	}

	fn watch(&self, _handler: Box<dyn Fn(&str, Option<&str>)>) {}
}
