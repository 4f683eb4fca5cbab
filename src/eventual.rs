use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tokio::task::AbortHandle;

/// One-shot future slot.
///
/// An `Eventual` starts pending, settles exactly once (resolved or
/// rejected), and keeps the settled outcome for late observers.
pub struct Eventual {
	body: Rc<EventualBody>,
}

impl Clone for Eventual {
	fn clone(&self) -> Self {
		Self { body: self.body.clone() }
	}
}

pub(crate) struct EventualBody {
	state: RefCell<EventualState>,
	task: RefCell<Option<AbortHandle>>,
}

enum EventualState {
	Pending(Vec<Box<dyn FnOnce(&Settled)>>),
	Settled(Settled),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Settled {
	Resolved(Value),
	Rejected(String),
}

impl Eventual {
	fn pending() -> Self {
		Eventual {
			body: Rc::new(EventualBody {
				state: RefCell::new(EventualState::Pending(Vec::new())),
				task: RefCell::new(None),
			}),
		}
	}

	/// Drives `future` on the local task set; the slot settles with its
	/// output. The task is aborted if the slot is dropped first.
	pub fn spawn<F>(future: F) -> Self
	where
		F: Future<Output = Result<Value, String>> + 'static,
	{
		let slot = Self::pending();
		let weak = Rc::downgrade(&slot.body);
		let handle = crate::spawn(async move {
			let outcome = match future.await {
				Ok(value) => Settled::Resolved(value),
				Err(error) => Settled::Rejected(error),
			};
			if let Some(body) = weak.upgrade() {
				EventualBody::settle(&body, outcome);
			}
		});
		*slot.body.task.borrow_mut() = Some(handle);
		slot
	}

	pub fn resolved(value: Value) -> Self {
		let slot = Self::pending();
		EventualBody::settle(&slot.body, Settled::Resolved(value));
		slot
	}

	pub fn rejected(error: impl Into<String>) -> Self {
		let slot = Self::pending();
		EventualBody::settle(&slot.body, Settled::Rejected(error.into()));
		slot
	}

	/// A slot settled by hand through the returned handle.
	pub fn deferred() -> (Self, EventualHandle) {
		let slot = Self::pending();
		let handle = EventualHandle { body: Rc::downgrade(&slot.body) };
		(slot, handle)
	}

	pub fn is_settled(&self) -> bool {
		matches!(&*self.body.state.borrow(), EventualState::Settled(_))
	}

	pub fn is_resolved(&self) -> bool {
		matches!(
			&*self.body.state.borrow(),
			EventualState::Settled(Settled::Resolved(_))
		)
	}

	/// The resolved value, if any.
	pub fn value(&self) -> Option<Value> {
		match &*self.body.state.borrow() {
			EventualState::Settled(Settled::Resolved(value)) => Some(value.clone()),
			_ => None,
		}
	}

	/// Registers a one-shot completion handler. Runs synchronously when
	/// the slot has already settled.
	pub(crate) fn on_settle(&self, f: impl FnOnce(&Settled) + 'static) {
		let mut f = Some(f);
		let settled = {
			let mut state = self.body.state.borrow_mut();
			match &mut *state {
				EventualState::Pending(queue) => {
					queue.push(Box::new(f.take().unwrap()));
					None
				}
				EventualState::Settled(outcome) => Some(outcome.clone()),
			}
		};
		if let Some(outcome) = settled {
			(f.take().unwrap())(&outcome);
		}
	}
}

impl EventualBody {
	fn settle(body: &Rc<EventualBody>, outcome: Settled) {
		let queue = {
			let mut state = body.state.borrow_mut();
			match &mut *state {
				EventualState::Pending(queue) => {
					let queue = std::mem::take(queue);
					*state = EventualState::Settled(outcome.clone());
					queue
				}
				EventualState::Settled(_) => {
					tracing::debug!("eventual settled twice, ignoring");
					return;
				}
			}
		};
		for f in queue {
			f(&outcome);
		}
	}
}

impl Drop for EventualBody {
	fn drop(&mut self) {
		if let Some(handle) = self.task.borrow_mut().take() {
			handle.abort();
		}
	}
}

/// Settles a deferred [`Eventual`]. Settling twice is ignored.
pub struct EventualHandle {
	body: Weak<EventualBody>,
}

impl EventualHandle {
	pub fn resolve(&self, value: Value) {
		if let Some(body) = self.body.upgrade() {
			EventualBody::settle(&body, Settled::Resolved(value));
		}
	}

	pub fn reject(&self, error: impl Into<String>) {
		if let Some(body) = self.body.upgrade() {
			EventualBody::settle(&body, Settled::Rejected(error.into()));
		}
	}
}
