use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::cell::{Cell, CellOptions, Produce, Token};

/// Always-ready mirror: follows the input while it is ready, shows
/// the default otherwise.
struct FallbackCore {
	input: Cell,
	default: Value,
	token: RefCell<Option<Token>>,
}

impl Produce for FallbackCore {
	fn activate(&self, cell: &Cell) {
		cell.default_to(self.default.clone());
		let input = self.input.clone();
		let weak = cell.downgrade();
		let token = self.input.notify(move || {
			let Some(cell) = weak.upgrade() else { return };
			match input.get() {
				Some(value) => cell.changed(Some(value)),
				None => cell.reset(),
			}
		});
		*self.token.borrow_mut() = Some(token);
	}

	fn deactivate(&self, _cell: &Cell) {
		if let Some(token) = self.token.borrow_mut().take() {
			self.input.unnotify(token);
		}
	}
}

impl Cell {
	/// A cell that mirrors this one when ready and falls back to
	/// `default` otherwise. Always ready once used.
	pub fn or(&self, default: Value) -> Cell {
		Cell::with_producer(
			CellOptions { may_be_null: true, ..Default::default() },
			Rc::new(FallbackCore {
				input: self.clone(),
				default,
				token: RefCell::new(None),
			}),
		)
	}
}
