use std::fmt::Debug;
use std::ops::Deref;

use serde_json::Value;

/// A value paired with the hash of its canonical serialisation.
///
/// Two values that serialise identically are equal for propagation
/// purposes. `serde_json::Value` keeps object keys in a `BTreeMap`,
/// so `to_string` is already canonical (sorted keys, no spacing).
pub struct Hashed {
	pub value: Value,
	pub hash: u64,
}

impl Hashed {
	pub fn new(value: Value) -> Self {
		let hash = canon_hash(&value);
		Self { value, hash }
	}
}

impl Deref for Hashed {
	type Target = Value;
	fn deref(&self) -> &Self::Target {
		&self.value
	}
}

impl Debug for Hashed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.value.fmt(f)
	}
}

pub fn canon_string(value: &Value) -> String {
	serde_json::to_string(value).expect("json value serialises")
}

pub fn canon_hash(value: &Value) -> u64 {
	fxhash::hash64(canon_string(value).as_bytes())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn key_order_is_canonical() {
		let a = json!({"b": 1, "a": 2});
		let mut map = serde_json::Map::new();
		map.insert("b".into(), json!(1));
		map.insert("a".into(), json!(2));
		let b = Value::Object(map);

		assert_eq!(canon_string(&a), canon_string(&b));
		assert_eq!(canon_hash(&a), canon_hash(&b));
	}

	#[test]
	fn distinct_values_hash_apart() {
		assert_ne!(canon_hash(&json!(1)), canon_hash(&json!(2)));
		assert_ne!(canon_hash(&json!(null)), canon_hash(&json!(0)));
		assert_ne!(canon_hash(&json!([1, 2])), canon_hash(&json!([2, 1])));
	}

	#[test]
	fn nested_structures_compare_deeply() {
		let a = json!({"outer": {"y": [1, 2], "x": true}});
		let b = json!({"outer": {"x": true, "y": [1, 2]}});
		assert_eq!(canon_hash(&a), canon_hash(&b));
	}
}
