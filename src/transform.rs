use std::cell::Cell as StdCell;
use std::cell::RefCell;
use std::rc::Rc;

use enclose::enclose;
use serde_json::Value;

use crate::cell::{Cell, CellOptions, Produce};
use crate::eventual::{Eventual, Settled};
use crate::input::{Input, DEFAULT_DEPTH};
use crate::reactive::{Compute, ReactiveCore};

/// What a transform callback produced. Plain values pass straight
/// through; cells, eventuals, and structures containing them are
/// resolved before the transform cell transitions.
pub enum Outcome {
	/// The undefined sentinel: resets the cell with a warning.
	Unset,
	Value(Value),
	Cell(Cell),
	Eventual(Eventual),
	Structure(Input),
}

impl From<Value> for Outcome {
	fn from(value: Value) -> Self {
		Outcome::Value(value)
	}
}

impl From<Option<Value>> for Outcome {
	fn from(value: Option<Value>) -> Self {
		match value {
			Some(value) => Outcome::Value(value),
			None => Outcome::Unset,
		}
	}
}

impl From<Cell> for Outcome {
	fn from(cell: Cell) -> Self {
		Outcome::Cell(cell)
	}
}

impl From<Eventual> for Outcome {
	fn from(eventual: Eventual) -> Self {
		Outcome::Eventual(eventual)
	}
}

impl From<Input> for Outcome {
	fn from(input: Input) -> Self {
		Outcome::Structure(input)
	}
}

#[derive(Clone)]
pub struct TransformOptions {
	/// Keep the last ready value while a new computation is in
	/// flight; otherwise reset first.
	pub latched: bool,
	/// Resolution depth into the input structures.
	pub depth: usize,
	/// Resolution depth into a structured output.
	pub out_depth: usize,
	/// Pure dependencies: transitions trigger recomputation but their
	/// values are not passed to the callback.
	pub deps: Vec<Cell>,
	pub cell: CellOptions,
}

impl Default for TransformOptions {
	fn default() -> Self {
		TransformOptions {
			latched: false,
			depth: DEFAULT_DEPTH,
			out_depth: DEFAULT_DEPTH,
			deps: Vec::new(),
			cell: CellOptions { may_be_null: true, ..Default::default() },
		}
	}
}

#[derive(Default)]
struct OutputState {
	epoch: StdCell<u64>,
	inner: RefCell<Option<Cell>>,
	pending: RefCell<Option<Eventual>>,
}

/// Reactive cell wrapped with the output-handling policy.
struct TransformCore {
	core: Rc<ReactiveCore>,
	out: Rc<OutputState>,
}

impl Produce for TransformCore {
	fn activate(&self, cell: &Cell) {
		self.core.activate(cell);
	}

	fn deactivate(&self, cell: &Cell) {
		self.core.deactivate(cell);
		self.out.epoch.set(self.out.epoch.get() + 1);
		if let Some(inner) = self.out.inner.borrow_mut().take() {
			inner.release();
		}
		self.out.pending.borrow_mut().take();
	}
}

impl Cell {
	/// Maps this cell through `f`, unpacking whatever `f` returns.
	pub fn map<O: Into<Outcome>>(&self, f: impl Fn(&Value) -> O + 'static) -> Cell {
		Cell::map_all(vec![Input::from(self)], move |args| f(&args[0]))
	}

	/// Maps N input structures through `f`.
	pub fn map_all<O: Into<Outcome>>(
		inputs: Vec<Input>,
		f: impl Fn(&[Value]) -> O + 'static,
	) -> Cell {
		Cell::transform(inputs, TransformOptions::default(), f)
	}

	/// Full-control transform constructor.
	pub fn transform<O: Into<Outcome>>(
		inputs: Vec<Input>,
		options: TransformOptions,
		f: impl Fn(&[Value]) -> O + 'static,
	) -> Cell {
		let out = Rc::new(OutputState::default());
		let latched = options.latched;
		let out_depth = options.out_depth;

		let compute: Compute = Rc::new(enclose!((out) move |cell: &Cell, args: Vec<Value>| {
			let outcome = f(&args).into();
			let epoch = out.epoch.get() + 1;
			out.epoch.set(epoch);
			if let Some(previous) = out.inner.borrow_mut().take() {
				previous.release();
			}
			out.pending.borrow_mut().take();

			match outcome {
				Outcome::Unset => {
					tracing::warn!(cell = cell.id(), "transform produced undefined, resetting");
					cell.reset();
				}
				Outcome::Value(value) => cell.changed(Some(value)),
				Outcome::Eventual(eventual) => {
					if !latched {
						cell.reset();
					}
					let weak = cell.downgrade();
					let guard = out.clone();
					eventual.on_settle(move |settled| {
						if guard.epoch.get() != epoch {
							return;
						}
						let Some(cell) = weak.upgrade() else { return };
						match settled {
							Settled::Resolved(value) => cell.changed(Some(value.clone())),
							Settled::Rejected(error) => {
								tracing::warn!(cell = cell.id(), %error, "transform output rejected");
								if !latched {
									cell.reset();
								}
							}
						}
					});
					*out.pending.borrow_mut() = Some(eventual);
				}
				Outcome::Cell(inner) => adopt(cell, &out, Input::Cell(inner), out_depth, latched),
				Outcome::Structure(structure) => adopt(cell, &out, structure, out_depth, latched),
			}
		}));

		let core = ReactiveCore::new(inputs, options.deps, options.depth, latched, compute);
		Cell::with_producer(options.cell, Rc::new(TransformCore { core, out }))
	}

	/// A cell whose value is the ordered list of resolved inputs.
	pub fn all(inputs: Vec<Input>) -> Cell {
		Cell::map_all(inputs, |args| Value::Array(args.to_vec()))
	}

	/// Maps each element of this cell's array value through `f`.
	/// Element results may themselves be cells or eventuals; the
	/// transform transitions once the whole list has resolved.
	pub fn map_each<O: Into<Outcome>>(&self, f: impl Fn(&Value) -> O + 'static) -> Cell {
		self.map(move |value| {
			let Value::Array(items) = value else {
				tracing::warn!("map_each over a non-array value");
				return Outcome::Unset;
			};
			let mut mapped = Vec::with_capacity(items.len());
			for item in items {
				match f(item).into() {
					Outcome::Unset => return Outcome::Unset,
					Outcome::Value(value) => mapped.push(Input::Value(value)),
					Outcome::Cell(cell) => mapped.push(Input::Cell(cell)),
					Outcome::Eventual(eventual) => mapped.push(Input::Eventual(eventual)),
					Outcome::Structure(structure) => mapped.push(structure),
				}
			}
			Outcome::Structure(Input::List(mapped))
		})
	}

	/// Folds this cell's array value.
	pub fn reduce(&self, init: Value, f: impl Fn(Value, &Value) -> Value + 'static) -> Cell {
		self.map(move |value| {
			let Value::Array(items) = value else {
				tracing::warn!("reduce over a non-array value");
				return Outcome::Unset;
			};
			Outcome::Value(items.iter().fold(init.clone(), |acc, item| f(acc, item)))
		})
	}
}

// Structured output: a transient reactive cell resolves it and feeds
// the finished value back into the transform cell.
fn adopt(cell: &Cell, out: &Rc<OutputState>, structure: Input, out_depth: usize, latched: bool) {
	if !latched {
		cell.reset();
	}
	let weak = cell.downgrade();
	let inner = Cell::reactive_with(vec![structure], Vec::new(), out_depth, move |_inner, args| {
		if let Some(cell) = weak.upgrade() {
			cell.changed(Some(args[0].clone()));
		}
	});
	inner.retain();
	*out.inner.borrow_mut() = Some(inner);
}
