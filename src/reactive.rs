use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value;
use smallvec::SmallVec;

use crate::cell::{Cell, CellOptions, Produce, Token};
use crate::eventual::Settled;
use crate::input::{self, Input, Leaf};

pub(crate) type Compute = Rc<dyn Fn(&Cell, Vec<Value>)>;

/// Recomputation engine behind reactive and transform cells.
///
/// On activate it walks every input structure up to the resolution
/// depth, registering readiness-notifiers on cells and completion
/// handlers on eventuals, plus notifiers on the pure dependencies.
/// Any of them bounces into the trampoline, which either resolves the
/// inputs and invokes the compute callback, or resets the cell.
pub(crate) struct ReactiveCore {
	inputs: Vec<Input>,
	deps: Vec<Cell>,
	depth: usize,
	latched: bool,
	compute: Compute,
	state: RefCell<CoreState>,
	this: Weak<ReactiveCore>,
}

#[derive(Default)]
struct CoreState {
	epoch: u64,
	registrations: SmallVec<[(Cell, Token); 4]>,
}

impl ReactiveCore {
	pub(crate) fn new(
		inputs: Vec<Input>,
		deps: Vec<Cell>,
		depth: usize,
		latched: bool,
		compute: Compute,
	) -> Rc<Self> {
		Rc::new_cyclic(|this| ReactiveCore {
			inputs,
			deps,
			depth,
			latched,
			compute,
			state: RefCell::new(CoreState::default()),
			this: this.clone(),
		})
	}

	fn trampoline(&self, cell: &Cell) {
		let ready = self.inputs.iter().all(|item| input::is_ready(item, self.depth));
		if ready {
			let args: Vec<Value> =
				self.inputs.iter().map(|item| input::resolve(item, self.depth)).collect();
			(self.compute)(cell, args);
		} else if !self.latched {
			cell.reset();
		}
	}

	fn track(&self, tracked: &Cell, token: Token) {
		self.state.borrow_mut().registrations.push((tracked.clone(), token));
	}
}

impl Produce for ReactiveCore {
	fn activate(&self, cell: &Cell) {
		let epoch = {
			let mut state = self.state.borrow_mut();
			state.epoch += 1;
			state.epoch
		};

		let weak_cell = cell.downgrade();
		let this = self.this.clone();
		let tramp: Rc<dyn Fn()> = Rc::new(move || {
			if let (Some(core), Some(cell)) = (this.upgrade(), weak_cell.upgrade()) {
				core.trampoline(&cell);
			}
		});

		let mut tracked = 0usize;

		for dep in &self.deps {
			let t = tramp.clone();
			let token = dep.notify(move || t());
			self.track(dep, token);
			tracked += 1;
		}

		for item in &self.inputs {
			input::visit(item, self.depth, &mut |leaf| match leaf {
				Leaf::Cell(input_cell) => {
					let t = tramp.clone();
					let token = input_cell.notify(move || t());
					self.track(input_cell, token);
					tracked += 1;
				}
				Leaf::Eventual(eventual) => {
					let this = self.this.clone();
					let weak_cell = cell.downgrade();
					eventual.on_settle(move |outcome| {
						let Some(core) = this.upgrade() else { return };
						if core.state.borrow().epoch != epoch {
							return;
						}
						match outcome {
							Settled::Resolved(_) => {
								if let Some(cell) = weak_cell.upgrade() {
									core.trampoline(&cell);
								}
							}
							Settled::Rejected(error) => {
								tracing::warn!(%error, "input eventual rejected, structure stays not ready");
							}
						}
					});
				}
			});
		}

		// Nothing registered means nothing will ever bounce for us.
		if tracked == 0 {
			self.trampoline(cell);
		}
	}

	fn deactivate(&self, _cell: &Cell) {
		let registrations = {
			let mut state = self.state.borrow_mut();
			state.epoch += 1;
			std::mem::take(&mut state.registrations)
		};
		for (tracked, token) in registrations.into_iter().rev() {
			tracked.unnotify(token);
		}
	}
}

impl Cell {
	/// A cell recomputed by `run` whenever any cell or eventual inside
	/// `inputs` changes, or any of the pure `deps` transitions. `run`
	/// receives the resolved input values and is free to drive the
	/// cell through [`Cell::changed`] and friends.
	pub fn reactive(
		inputs: Vec<Input>,
		deps: Vec<Cell>,
		run: impl Fn(&Cell, &[Value]) + 'static,
	) -> Cell {
		Self::reactive_with(inputs, deps, input::DEFAULT_DEPTH, run)
	}

	pub fn reactive_with(
		inputs: Vec<Input>,
		deps: Vec<Cell>,
		depth: usize,
		run: impl Fn(&Cell, &[Value]) + 'static,
	) -> Cell {
		let compute: Compute = Rc::new(move |cell: &Cell, args: Vec<Value>| run(cell, &args));
		let core = ReactiveCore::new(inputs, deps, depth, false, compute);
		let options = CellOptions { may_be_null: true, ..Default::default() };
		Cell::with_producer(options, core)
	}
}
