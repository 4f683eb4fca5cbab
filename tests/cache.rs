use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use spook::macros::enclose;
use spook::{CacheId, Cell, CellOptions, ColdPolicy, MemoryStore, SharedCache};

fn cached_cell(uuid: &str) -> Cell {
	Cell::with_options(CellOptions {
		cache: Some(CacheId::new(uuid)),
		..Default::default()
	})
}

fn record(seen: &Rc<RefCell<Vec<Value>>>, cell: &Cell) -> spook::Token {
	cell.tie(enclose!((seen) move |value| seen.borrow_mut().push(value.clone())))
}

#[test]
fn single_owner_across_instances() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	let b = SharedCache::new(Rc::new(store.attach()));

	a.install();
	let cell_a = cached_cell("u-1");
	let _token_a = cell_a.tie(|_| {});
	assert_eq!(store.get("owner.u-1"), Some(a.session()));

	b.install();
	let cell_b = cached_cell("u-1");
	let seen = Rc::new(RefCell::new(Vec::new()));
	let _token_b = record(&seen, &cell_b);

	// The peer joined as a passive mirror, not a second owner.
	assert_eq!(store.get("owner.u-1"), Some(a.session()));

	cell_a.trigger(json!(5));
	assert_eq!(store.get("value.u-1"), Some("5".to_string()));
	assert_eq!(cell_b.get(), Some(json!(5)));
	assert_eq!(&*seen.borrow(), &[json!(5)]);

	SharedCache::uninstall();
}

#[test]
fn late_instance_restores_the_persisted_value() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	a.install();
	let cell_a = cached_cell("u-2");
	let _token_a = cell_a.tie(|_| {});
	cell_a.trigger(json!({"height": 10}));

	let b = SharedCache::new(Rc::new(store.attach()));
	b.install();
	let cell_b = cached_cell("u-2");
	let seen = Rc::new(RefCell::new(Vec::new()));
	let _token_b = record(&seen, &cell_b);

	assert_eq!(&*seen.borrow(), &[json!({"height": 10})]);

	SharedCache::uninstall();
}

#[test]
fn ownership_migrates_when_the_owner_lets_go() {
	let store = MemoryStore::new();
	let a = SharedCache::with_policy(Rc::new(store.attach()), ColdPolicy::Finalize);
	let b = SharedCache::with_policy(Rc::new(store.attach()), ColdPolicy::Finalize);

	a.install();
	let cell_a = cached_cell("u-3");
	let token_a = cell_a.tie(|_| {});

	b.install();
	let cell_b = cached_cell("u-3");
	let _token_b = cell_b.tie(|_| {});
	assert_eq!(store.get("owner.u-3"), Some(a.session()));

	cell_a.untie(token_a);

	// The released owner key let the peer adopt.
	assert_eq!(store.get("owner.u-3"), Some(b.session()));

	SharedCache::uninstall();
}

#[test]
fn cold_primary_is_retained_for_reuse() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	a.install();

	let cell = cached_cell("u-4");
	let token = cell.tie(|_| {});
	cell.trigger(json!(1));
	cell.untie(token);

	// Still the storage owner: the cold primary was kept around.
	assert_eq!(store.get("owner.u-4"), Some(a.session()));

	let token = cell.tie(|_| {});
	cell.trigger(json!(2));
	assert_eq!(store.get("value.u-4"), Some("2".to_string()));
	cell.untie(token);

	SharedCache::uninstall();
}

#[test]
fn finalize_policy_relinquishes_without_users() {
	let store = MemoryStore::new();
	let a = SharedCache::with_policy(Rc::new(store.attach()), ColdPolicy::Finalize);
	a.install();

	let cell = cached_cell("u-5");
	let token = cell.tie(|_| {});
	assert_eq!(store.get("owner.u-5"), Some(a.session()));

	cell.untie(token);
	assert_eq!(store.get("owner.u-5"), None);

	SharedCache::uninstall();
}

#[test]
fn unload_releases_owned_keys() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	a.install();

	let cell = cached_cell("u-6");
	let _token = cell.tie(|_| {});
	assert_eq!(store.get("owner.u-6"), Some(a.session()));

	a.unload();
	assert_eq!(store.get("owner.u-6"), None);

	SharedCache::uninstall();
}

#[test]
fn mirrors_in_one_instance_share_the_primary() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	a.install();

	let first = cached_cell("u-7");
	let second = cached_cell("u-7");
	let _token_first = first.tie(|_| {});
	first.trigger(json!(7));

	let seen = Rc::new(RefCell::new(Vec::new()));
	let _token_second = record(&seen, &second);
	assert_eq!(&*seen.borrow(), &[json!(7)]);

	first.trigger(json!(8));
	assert_eq!(&*seen.borrow(), &[json!(7), json!(8)]);

	SharedCache::uninstall();
}

fn height_id(uuid: &str) -> CacheId {
	CacheId {
		uuid: uuid.to_string(),
		serialize: Some(Rc::new(|value| format!("H{}", value["height"]))),
		deserialize: Some(Rc::new(|text| {
			text.strip_prefix('H')
				.and_then(|rest| rest.parse::<i64>().ok())
				.map(|height| json!({ "height": height }))
		})),
	}
}

#[test]
fn custom_serializers_drive_persistence() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	a.install();

	let cell = Cell::with_options(CellOptions {
		cache: Some(height_id("u-8")),
		..Default::default()
	});
	let _token = cell.tie(|_| {});
	cell.trigger(json!({"height": 42}));
	assert_eq!(store.get("value.u-8"), Some("H42".to_string()));

	let b = SharedCache::new(Rc::new(store.attach()));
	b.install();
	let mirror = Cell::with_options(CellOptions {
		cache: Some(height_id("u-8")),
		..Default::default()
	});
	let seen = Rc::new(RefCell::new(Vec::new()));
	let _mirror_token = record(&seen, &mirror);
	assert_eq!(&*seen.borrow(), &[json!({"height": 42})]);

	SharedCache::uninstall();
}

#[test]
fn losing_the_owner_key_demotes_the_primary() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	let rogue = store.attach();

	a.install();
	let cell = cached_cell("u-10");
	let _token = cell.tie(|_| {});
	assert_eq!(store.get("owner.u-10"), Some(a.session()));

	// Another instance overwrites the owner key; this instance must
	// stand down and stop publishing.
	use spook::Storage;
	rogue.set("owner.u-10", "deadbeef");
	cell.trigger(json!(1));
	assert_eq!(store.get("value.u-10"), None);

	// Once the key is released, the survivor adopts again.
	rogue.remove("owner.u-10");
	assert_eq!(store.get("owner.u-10"), Some(a.session()));
	cell.trigger(json!(2));
	assert_eq!(store.get("value.u-10"), Some("2".to_string()));

	SharedCache::uninstall();
}

#[test]
fn owner_reset_clears_peers() {
	let store = MemoryStore::new();
	let a = SharedCache::new(Rc::new(store.attach()));
	let b = SharedCache::new(Rc::new(store.attach()));

	a.install();
	let cell_a = cached_cell("u-9");
	let _token_a = cell_a.tie(|_| {});
	cell_a.trigger(json!(3));

	b.install();
	let cell_b = cached_cell("u-9");
	let _token_b = cell_b.tie(|_| {});
	assert_eq!(cell_b.get(), Some(json!(3)));

	cell_a.reset();
	assert_eq!(store.get("value.u-9"), None);
	assert!(!cell_b.is_ready());

	SharedCache::uninstall();
}
