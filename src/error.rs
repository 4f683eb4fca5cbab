use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("bridge item rejected: {0}")]
	Rejected(String),

	#[error("bridge canceled before completion")]
	Canceled,
}
