use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::Digest;
use sha2::Sha256;

use crate::Value;

/// A variable store shared between the engine and its include callbacks.
///
/// The engine reads it when building a render environment and snapshots and
/// restores it around every pre-render callback. Serializing concurrent
/// renders that share one store is up to the host.
pub type SharedVariables = Arc<Mutex<Variables>>;

/// A case-insensitive map of variable names to values.
///
/// Lookups ignore case; the spelling used on insertion is kept for
/// iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
	entries: HashMap<String, (String, Value)>,
}

impl Variables {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build an environment from scope layers, lowest priority first. Later
	/// layers shadow earlier ones.
	pub fn layered<'a>(layers: impl IntoIterator<Item = &'a Variables>) -> Self {
		let mut result = Self::new();
		for layer in layers {
			result.extend_from(layer);
		}
		result
	}

	/// Bind `name`, returning the previous value bound under any spelling of
	/// it.
	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
		let name = name.into();
		self.entries
			.insert(fold(&name), (name, value.into()))
			.map(|(_, previous)| previous)
	}

	pub fn get(&self, name: &str) -> Option<&Value> {
		self.entries.get(&fold(name)).map(|(_, value)| value)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.contains_key(&fold(name))
	}

	pub fn remove(&mut self, name: &str) -> Option<Value> {
		self.entries.remove(&fold(name)).map(|(_, value)| value)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// Keep only the variables for which `keep` returns true.
	pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
		self.entries.retain(|_, (name, value)| keep(name, value));
	}

	/// Iterate `(name, value)` pairs in no particular order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.entries
			.values()
			.map(|(name, value)| (name.as_str(), value))
	}

	/// Copy every binding of `other` into `self`, overwriting collisions.
	pub fn extend_from(&mut self, other: &Variables) {
		for (key, entry) in &other.entries {
			self.entries.insert(key.clone(), entry.clone());
		}
	}

	/// The bindings of `self` whose value differs from (or is missing in)
	/// `before`.
	pub fn changed_since(&self, before: &Variables) -> Variables {
		let entries = self
			.entries
			.iter()
			.filter(|(key, (_, value))| {
				before
					.entries
					.get(*key)
					.is_none_or(|(_, previous)| previous != value)
			})
			.map(|(key, entry)| (key.clone(), entry.clone()))
			.collect();

		Variables { entries }
	}

	/// A stable SHA-256 digest of the current bindings, independent of
	/// insertion order and name spelling.
	pub fn fingerprint(&self) -> String {
		let sorted: BTreeMap<&str, &Value> = self
			.entries
			.iter()
			.map(|(key, (_, value))| (key.as_str(), value))
			.collect();

		let mut hasher = Sha256::new();
		match serde_json::to_vec(&sorted) {
			Ok(bytes) => hasher.update(&bytes),
			Err(_) => {
				for (key, value) in &sorted {
					hasher.update(key.as_bytes());
					hasher.update(format!("{value:?}").as_bytes());
				}
			}
		}

		to_hex(&hasher.finalize())
	}
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Variables {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut variables = Self::new();
		for (name, value) in iter {
			variables.insert(name, value);
		}
		variables
	}
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Variables {
	fn from(entries: [(K, V); N]) -> Self {
		entries.into_iter().collect()
	}
}

fn fold(name: &str) -> String {
	name.to_lowercase()
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
	use std::fmt::Write;

	let mut hex = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		let _ = write!(hex, "{byte:02x}");
	}
	hex
}
