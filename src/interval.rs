use std::cell::Cell as StdCell;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::task::AbortHandle;

use crate::cell::{Cell, CellOptions, Produce};

thread_local! {
	static ACTIVE: StdCell<usize> = StdCell::new(0);
}

/// Number of interval cells currently holding a live timer.
pub fn active_timers() -> usize {
	ACTIVE.with(|count| count.get())
}

struct IntervalCore {
	task: RefCell<Option<AbortHandle>>,
}

impl Produce for IntervalCore {
	fn activate(&self, cell: &Cell) {
		ACTIVE.with(|count| count.set(count.get() + 1));
		let weak = cell.downgrade();
		let handle = crate::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(1));
			loop {
				ticker.tick().await;
				let Some(cell) = weak.upgrade() else { break };
				cell.trigger(Value::from(unix_seconds()));
			}
		});
		*self.task.borrow_mut() = Some(handle);
	}

	fn deactivate(&self, _cell: &Cell) {
		if let Some(handle) = self.task.borrow_mut().take() {
			handle.abort();
			ACTIVE.with(|count| count.set(count.get() - 1));
		}
	}
}

fn unix_seconds() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs())
		.unwrap_or(0)
}

impl Cell {
	/// While in use, emits the wall-clock unix time in whole seconds
	/// at a one-second cadence. The timer is released on finalise.
	pub fn interval() -> Cell {
		Cell::with_producer(
			CellOptions::default(),
			Rc::new(IntervalCore { task: RefCell::new(None) }),
		)
	}
}
