use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::cell::{Cell, CellOptions, Produce, Token};

/// Latch: presents the default until the input first becomes ready,
/// adopts that value, and detaches from the input permanently.
struct LatchCore {
	input: Cell,
	default: Option<Value>,
	state: RefCell<LatchState>,
	this: Weak<LatchCore>,
}

#[derive(Default)]
struct LatchState {
	adopted: bool,
	token: Option<Token>,
}

impl LatchCore {
	fn build(input: Cell, default: Option<Value>) -> Rc<Self> {
		Rc::new_cyclic(|this| LatchCore {
			input,
			default,
			state: RefCell::new(LatchState::default()),
			this: this.clone(),
		})
	}
}

impl Produce for LatchCore {
	fn activate(&self, cell: &Cell) {
		if let Some(value) = &self.default {
			if !cell.is_ready() {
				cell.trigger(value.clone());
			}
		}
		if self.state.borrow().adopted {
			return;
		}

		let this = self.this.clone();
		let input = self.input.clone();
		let weak = cell.downgrade();
		let token = self.input.notify(move || {
			let Some(core) = this.upgrade() else { return };
			if core.state.borrow().adopted || !input.is_ready() {
				return;
			}
			core.state.borrow_mut().adopted = true;
			if let Some(cell) = weak.upgrade() {
				cell.changed(input.get());
			}
			let token = core.state.borrow_mut().token.take();
			if let Some(token) = token {
				core.input.unnotify(token);
			}
		});

		// The notifier fires synchronously for an already-ready input;
		// in that case it could not see its own token yet.
		if self.state.borrow().adopted {
			self.input.unnotify(token);
		} else {
			self.state.borrow_mut().token = Some(token);
		}
	}

	fn deactivate(&self, _cell: &Cell) {
		let token = self.state.borrow_mut().token.take();
		if let Some(token) = token {
			self.input.unnotify(token);
		}
	}
}

impl Cell {
	/// A cell that shows `default` (when given) until this cell first
	/// becomes ready, then holds that first value forever.
	pub fn latched(&self, default: Option<Value>) -> Cell {
		Cell::with_producer(
			CellOptions { may_be_null: true, ..Default::default() },
			LatchCore::build(self.clone(), default),
		)
	}
}
