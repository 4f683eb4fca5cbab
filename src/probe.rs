use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::cell::{Cell, CellOptions, Produce, Token};

/// Readiness probe: an always-ready boolean view of the input's
/// readiness, optionally negated.
struct ProbeCore {
	input: Cell,
	negate: bool,
	token: RefCell<Option<Token>>,
}

impl Produce for ProbeCore {
	fn activate(&self, cell: &Cell) {
		let input = self.input.clone();
		let negate = self.negate;
		let weak = cell.downgrade();
		let push: Rc<dyn Fn()> = Rc::new(move || {
			if let Some(cell) = weak.upgrade() {
				cell.changed(Some(Value::Bool(input.is_ready() != negate)));
			}
		});
		let token = {
			let push = push.clone();
			self.input.notify(move || push())
		};
		push();
		*self.token.borrow_mut() = Some(token);
	}

	fn deactivate(&self, _cell: &Cell) {
		if let Some(token) = self.token.borrow_mut().take() {
			self.input.unnotify(token);
		}
	}
}

impl Cell {
	/// Always-ready cell holding this cell's readiness as a boolean.
	pub fn ready(&self) -> Cell {
		self.probe(false)
	}

	/// Negated [`Cell::ready`].
	pub fn not_ready(&self) -> Cell {
		self.probe(true)
	}

	fn probe(&self, negate: bool) -> Cell {
		Cell::with_producer(
			CellOptions { may_be_null: true, ..Default::default() },
			Rc::new(ProbeCore {
				input: self.clone(),
				negate,
				token: RefCell::new(None),
			}),
		)
	}
}
