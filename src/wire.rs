//! Cross-frame wire messages.
//!
//! The external shapes are fixed: every message is a one-key object
//! whose key names the operation, exactly as peers on the other side
//! of the frame boundary expect them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum WireMessage {
	/// Child → parent handshake.
	#[serde(rename = "helloSpookProxy")]
	Hello(bool),

	/// Child → parent: start mirroring this uuid.
	#[serde(rename = "useSpook")]
	Use(String),

	/// Child → parent: stop mirroring this uuid.
	#[serde(rename = "dropSpook")]
	Drop(String),

	/// Parent → child handshake reply.
	#[serde(rename = "spookProxyInfo")]
	ProxyInfo(ProxyInfo),

	/// Parent → child value update. Both payload fields absent means
	/// not-ready.
	#[serde(rename = "spookCacheUpdate")]
	CacheUpdate(CacheUpdate),

	/// Parent → child: the uuid cannot be resolved on this side.
	#[serde(rename = "spookUnknown")]
	Unknown(UnknownUuid),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
	pub defer_parent_prefix: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CacheUpdate {
	pub uuid: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	#[serde(
		rename = "valueString",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub value_string: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UnknownUuid {
	pub uuid: String,
}
