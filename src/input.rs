use std::collections::BTreeMap;

use serde_json::Value;

use crate::cell::Cell;
use crate::eventual::Eventual;

/// Default number of container levels traversed when resolving
/// structured inputs and outputs.
pub const DEFAULT_DEPTH: usize = 4;

/// A structured input: an arbitrary tree of values, cells, and
/// eventuals. Containers are traversed up to a depth limit; anything
/// deeper is opaque.
pub enum Input {
	Value(Value),
	Cell(Cell),
	Eventual(Eventual),
	List(Vec<Input>),
	Map(BTreeMap<String, Input>),
}

impl Clone for Input {
	fn clone(&self) -> Self {
		match self {
			Input::Value(v) => Input::Value(v.clone()),
			Input::Cell(c) => Input::Cell(c.clone()),
			Input::Eventual(e) => Input::Eventual(e.clone()),
			Input::List(items) => Input::List(items.clone()),
			Input::Map(map) => Input::Map(map.clone()),
		}
	}
}

impl From<Value> for Input {
	fn from(value: Value) -> Self {
		Input::Value(value)
	}
}

impl From<Cell> for Input {
	fn from(cell: Cell) -> Self {
		Input::Cell(cell)
	}
}

impl From<&Cell> for Input {
	fn from(cell: &Cell) -> Self {
		Input::Cell(cell.clone())
	}
}

impl From<Eventual> for Input {
	fn from(eventual: Eventual) -> Self {
		Input::Eventual(eventual)
	}
}

impl From<Vec<Input>> for Input {
	fn from(items: Vec<Input>) -> Self {
		Input::List(items)
	}
}

impl From<BTreeMap<String, Input>> for Input {
	fn from(map: BTreeMap<String, Input>) -> Self {
		Input::Map(map)
	}
}

impl From<&str> for Input {
	fn from(text: &str) -> Self {
		Input::Value(Value::from(text))
	}
}

pub(crate) enum Leaf<'a> {
	Cell(&'a Cell),
	Eventual(&'a Eventual),
}

/// Walks every cell and eventual reachable within `depth` container
/// levels, in a stable left-to-right order.
pub(crate) fn visit<'a>(input: &'a Input, depth: usize, f: &mut dyn FnMut(Leaf<'a>)) {
	match input {
		Input::Value(_) => {}
		Input::Cell(cell) => f(Leaf::Cell(cell)),
		Input::Eventual(eventual) => f(Leaf::Eventual(eventual)),
		Input::List(items) => {
			if depth > 0 {
				for item in items {
					visit(item, depth - 1, f);
				}
			}
		}
		Input::Map(map) => {
			if depth > 0 {
				for item in map.values() {
					visit(item, depth - 1, f);
				}
			}
		}
	}
}

/// A structure is ready iff every in-depth cell is ready and every
/// in-depth eventual has resolved. Beyond the limit it is opaque.
pub(crate) fn is_ready(input: &Input, depth: usize) -> bool {
	match input {
		Input::Value(_) => true,
		Input::Cell(cell) => cell.is_ready(),
		Input::Eventual(eventual) => eventual.is_resolved(),
		Input::List(items) => {
			depth == 0 || items.iter().all(|item| is_ready(item, depth - 1))
		}
		Input::Map(map) => {
			depth == 0 || map.values().all(|item| is_ready(item, depth - 1))
		}
	}
}

/// Spine-copies the structure, substituting each in-depth cell and
/// eventual with its current value. Callers check readiness first.
pub(crate) fn resolve(input: &Input, depth: usize) -> Value {
	match input {
		Input::Value(value) => value.clone(),
		Input::Cell(cell) => cell.get().unwrap_or(Value::Null),
		Input::Eventual(eventual) => eventual.value().unwrap_or(Value::Null),
		Input::List(items) => {
			if depth == 0 {
				opaque(input)
			} else {
				Value::Array(items.iter().map(|item| resolve(item, depth - 1)).collect())
			}
		}
		Input::Map(map) => {
			if depth == 0 {
				opaque(input)
			} else {
				Value::Object(
					map.iter()
						.map(|(key, item)| (key.clone(), resolve(item, depth - 1)))
						.collect(),
				)
			}
		}
	}
}

// Conversion for containers past the depth limit. There is no cell
// representation inside a plain value, so live leaves become null.
fn opaque(input: &Input) -> Value {
	match input {
		Input::Value(value) => value.clone(),
		Input::Cell(cell) => {
			tracing::warn!(cell = cell.id(), "cell beyond resolution depth, substituting null");
			Value::Null
		}
		Input::Eventual(_) => {
			tracing::warn!("eventual beyond resolution depth, substituting null");
			Value::Null
		}
		Input::List(items) => Value::Array(items.iter().map(opaque).collect()),
		Input::Map(map) => {
			Value::Object(map.iter().map(|(key, item)| (key.clone(), opaque(item))).collect())
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn plain_values_are_always_ready() {
		let input = Input::from(json!({"a": [1, 2, 3]}));
		assert!(is_ready(&input, DEFAULT_DEPTH));
		assert_eq!(resolve(&input, DEFAULT_DEPTH), json!({"a": [1, 2, 3]}));
	}

	#[test]
	fn nested_cell_gates_readiness() {
		let cell = Cell::new();
		let input = Input::List(vec![Input::from(json!(1)), Input::from(&cell)]);

		assert!(!is_ready(&input, DEFAULT_DEPTH));
		cell.trigger(json!(2));
		assert!(is_ready(&input, DEFAULT_DEPTH));
		assert_eq!(resolve(&input, DEFAULT_DEPTH), json!([1, 2]));
	}

	#[test]
	fn depth_limit_makes_structures_opaque() {
		let cell = Cell::new();
		let input = Input::List(vec![Input::from(&cell)]);

		// Depth 0: the list is opaque, the unready cell inside does
		// not gate readiness and resolves to null.
		assert!(is_ready(&input, 0));
		assert_eq!(resolve(&input, 0), json!([null]));
	}

	#[test]
	fn visit_collects_in_order() {
		let a = Cell::new();
		let b = Cell::new();
		let mut map = BTreeMap::new();
		map.insert("k".to_string(), Input::from(&b));
		let input = Input::List(vec![Input::from(&a), Input::Map(map)]);

		let mut seen = Vec::new();
		visit(&input, DEFAULT_DEPTH, &mut |leaf| {
			if let Leaf::Cell(cell) = leaf {
				seen.push(cell.id());
			}
		});
		assert_eq!(seen, vec![a.id(), b.id()]);
	}
}
