use serde_json::Value;

use crate::cell::Cell;
use crate::input::Input;

impl Cell {
	/// Dynamic subscript: a transform cell computing `value[key]`.
	/// The key may itself be a cell (or any structured input); the
	/// result recomputes when either side changes. A missing key
	/// behaves like an undefined result and resets the cell.
	pub fn sub(&self, key: impl Into<Input>) -> Cell {
		Cell::map_all(vec![Input::from(self), key.into()], |args| index(&args[0], &args[1]))
	}

	/// Nested access: folds [`Cell::sub`] over `keys`.
	pub fn path<K: Into<Input>>(&self, keys: impl IntoIterator<Item = K>) -> Cell {
		keys.into_iter().fold(self.clone(), |cell, key| cell.sub(key))
	}
}

fn index(value: &Value, key: &Value) -> Option<Value> {
	match (value, key) {
		(Value::Object(map), Value::String(name)) => map.get(name).cloned(),
		(Value::Object(map), Value::Number(number)) => map.get(&number.to_string()).cloned(),
		(Value::Array(items), Value::Number(number)) => {
			number.as_u64().and_then(|i| items.get(i as usize)).cloned()
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn index_covers_objects_and_arrays() {
		assert_eq!(index(&json!({"a": 1}), &json!("a")), Some(json!(1)));
		assert_eq!(index(&json!({"a": 1}), &json!("b")), None);
		assert_eq!(index(&json!([10, 20]), &json!(1)), Some(json!(20)));
		assert_eq!(index(&json!([10, 20]), &json!(5)), None);
		assert_eq!(index(&json!({"0": "x"}), &json!(0)), Some(json!("x")));
		assert_eq!(index(&json!(42), &json!("a")), None);
	}
}
