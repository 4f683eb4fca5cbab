use std::sync::{Arc, Mutex, MutexGuard};

use mockall::*;
use serde_json::Value;

#[automock]
pub trait Spy {
	fn observe(&self, value: Value);
}

#[derive(Clone)]
pub struct SharedMock(Arc<Mutex<MockSpy>>);

impl SharedMock {
	pub fn new() -> SharedMock {
		SharedMock(Arc::new(Mutex::new(MockSpy::new())))
	}

	pub fn get<'a>(&'a self) -> MutexGuard<'a, MockSpy> {
		return self.0.lock().unwrap();
	}
}
