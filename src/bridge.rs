use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::channel::oneshot;
use serde_json::Value;

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::eventual::{Eventual, Settled};
use crate::input::Input;

struct Gather {
	slots: Vec<Option<Value>>,
	missing: usize,
	tx: Option<oneshot::Sender<Result<Vec<Value>>>>,
	holds: Vec<Cell>,
	held: Vec<Eventual>,
}

impl Gather {
	fn fill(gather: &Rc<RefCell<Gather>>, index: usize, value: Value) {
		{
			let mut this = gather.borrow_mut();
			if this.tx.is_none() {
				return;
			}
			if this.slots[index].is_none() {
				this.missing -= 1;
			}
			this.slots[index] = Some(value);
		}
		Gather::flush(gather);
	}

	fn flush(gather: &Rc<RefCell<Gather>>) {
		let send = {
			let mut this = gather.borrow_mut();
			if this.missing > 0 {
				None
			} else {
				this.tx.take().map(|tx| {
					let values: Vec<Value> = this
						.slots
						.iter_mut()
						.map(|slot| slot.take().unwrap_or(Value::Null))
						.collect();
					(tx, values)
				})
			}
		};
		if let Some((tx, values)) = send {
			let _ = tx.send(Ok(values));
		}
	}

	fn fail(gather: &Rc<RefCell<Gather>>, error: String) {
		let tx = gather.borrow_mut().tx.take();
		if let Some(tx) = tx {
			let _ = tx.send(Err(Error::Rejected(error)));
		}
	}
}

/// Resolves an ordered list of items — plain values, cells,
/// eventuals, or structures of them — into one future. Cells are
/// observed through their one-shot queue (with the matching
/// retain/release accounting); the future rejects permanently if any
/// contained eventual rejects.
pub fn promise(items: Vec<Input>) -> impl Future<Output = Result<Vec<Value>>> {
	let (tx, rx) = oneshot::channel::<Result<Vec<Value>>>();
	let count = items.len();
	let gather = Rc::new(RefCell::new(Gather {
		slots: vec![None; count],
		missing: count,
		tx: Some(tx),
		holds: Vec::new(),
		held: Vec::new(),
	}));

	for (index, item) in items.into_iter().enumerate() {
		match item {
			Input::Value(value) => Gather::fill(&gather, index, value),
			Input::Cell(cell) => {
				let g = gather.clone();
				cell.then(move |value| Gather::fill(&g, index, value.clone()));
				gather.borrow_mut().holds.push(cell);
			}
			Input::Eventual(eventual) => {
				let g = gather.clone();
				eventual.on_settle(move |settled| match settled {
					Settled::Resolved(value) => Gather::fill(&g, index, value.clone()),
					Settled::Rejected(error) => Gather::fail(&g, error.clone()),
				});
				gather.borrow_mut().held.push(eventual);
			}
			structure @ (Input::List(_) | Input::Map(_)) => {
				let resolver = Cell::all(vec![structure]);
				let g = gather.clone();
				resolver.then(move |value| {
					let item = value
						.as_array()
						.and_then(|items| items.first())
						.cloned()
						.unwrap_or(Value::Null);
					Gather::fill(&g, index, item);
				});
				gather.borrow_mut().holds.push(resolver);
			}
		}
	}

	Gather::flush(&gather);

	async move {
		match rx.await {
			Ok(result) => result,
			Err(_) => Err(Error::Canceled),
		}
	}
}

impl Cell {
	/// See [`promise`].
	pub fn promise(items: Vec<Input>) -> impl Future<Output = Result<Vec<Value>>> {
		promise(items)
	}
}
