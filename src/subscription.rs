use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cell::{Cell, CellOptions, Produce};

pub type PushFn = Box<dyn Fn(Value)>;

/// Client seam for push subscriptions backing producer cells. The
/// RPC layer owns transport, retries, and timeouts; the cell only
/// relays pushed values.
pub trait Subscribe {
	fn open(&self, params: &Value, push: PushFn) -> Subscription;
}

/// Guard for an open subscription: cancels its token when dropped.
pub struct Subscription {
	cancel: CancellationToken,
}

impl Subscription {
	pub fn new(cancel: CancellationToken) -> Self {
		Subscription { cancel }
	}

	/// Token for the backend task to select on.
	pub fn token(&self) -> CancellationToken {
		self.cancel.clone()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

struct SubscriptionCore {
	client: Rc<dyn Subscribe>,
	params: Value,
	open: RefCell<Option<Subscription>>,
}

impl Produce for SubscriptionCore {
	fn activate(&self, cell: &Cell) {
		let weak = cell.downgrade();
		let push: PushFn = Box::new(move |value| {
			if let Some(cell) = weak.upgrade() {
				cell.trigger(value);
			}
		});
		*self.open.borrow_mut() = Some(self.client.open(&self.params, push));
	}

	fn deactivate(&self, _cell: &Cell) {
		self.open.borrow_mut().take();
	}
}

impl Cell {
	/// Producer over an injected subscription client: opens on first
	/// use, relays pushed values through trigger, closes on finalise.
	pub fn subscription(client: Rc<dyn Subscribe>, params: Value) -> Cell {
		Cell::with_producer(
			CellOptions::default(),
			Rc::new(SubscriptionCore {
				client,
				params,
				open: RefCell::new(None),
			}),
		)
	}
}
