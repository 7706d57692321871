//! Named value filters applied through `{{ value | name:arg,arg }}` pipes.
//!
//! Filters are looked up in the engine's own registry first and then in the
//! process-wide registry. A name registered in neither passes the value
//! through unchanged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::Value;

/// A filter receives the piped value and its resolved arguments.
pub type FilterFn = Arc<dyn Fn(&Value, &[Value]) -> Value + Send + Sync>;

static GLOBAL_FILTERS: LazyLock<FilterRegistry> = LazyLock::new(FilterRegistry::with_builtins);

/// A case-insensitive registry of filters. Clones share the same table.
#[derive(Clone, Default)]
pub struct FilterRegistry {
	filters: Arc<RwLock<HashMap<String, FilterFn>>>,
}

impl fmt::Debug for FilterRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut names: Vec<String> = self.filters.read().keys().cloned().collect();
		names.sort_unstable();
		f.debug_struct("FilterRegistry")
			.field("filters", &names)
			.finish()
	}
}

impl FilterRegistry {
	/// An empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// A registry holding the built-in `upper`, `lower`, `trim`, `length` and
	/// `default` filters.
	pub fn with_builtins() -> Self {
		let registry = Self::new();
		registry.register("upper", |value, _| Value::from(value.to_string().to_uppercase()));
		registry.register("lower", |value, _| Value::from(value.to_string().to_lowercase()));
		registry.register("trim", |value, _| {
			match value {
				Value::String(text) => Value::from(text.trim()),
				other => other.clone(),
			}
		});
		registry.register("length", |value, _| {
			match value {
				Value::String(text) => Value::from(text.chars().count()),
				Value::List(items) => Value::from(items.len()),
				Value::Map(entries) => Value::from(entries.len()),
				Value::Null => Value::from(0_i64),
				other => other.try_iter().map_or(Value::Null, |iter| Value::from(iter.count())),
			}
		});
		registry.register("default", |value, arguments| {
			if value.is_empty_text() {
				arguments.first().cloned().unwrap_or_default()
			} else {
				value.clone()
			}
		});
		registry
	}

	pub fn register(
		&self,
		name: impl AsRef<str>,
		filter: impl Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
	) {
		self.filters
			.write()
			.insert(name.as_ref().to_lowercase(), Arc::new(filter));
	}

	pub fn unregister(&self, name: &str) -> bool {
		self.filters.write().remove(&name.to_lowercase()).is_some()
	}

	pub fn get(&self, name: &str) -> Option<FilterFn> {
		self.filters.read().get(&name.to_lowercase()).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.filters.read().contains_key(&name.to_lowercase())
	}

	/// Apply the filter `name`, consulting this registry before the
	/// process-wide one.
	pub fn invoke(&self, name: &str, value: &Value, arguments: &[Value]) -> Value {
		match self.get(name).or_else(|| GLOBAL_FILTERS.get(name)) {
			Some(filter) => filter(value, arguments),
			None => value.clone(),
		}
	}
}

/// Register a filter available to every engine in the process.
pub fn register_filter(
	name: impl AsRef<str>,
	filter: impl Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
) {
	GLOBAL_FILTERS.register(name, filter);
}

/// The process-wide filter registry.
pub fn global_filters() -> &'static FilterRegistry {
	&GLOBAL_FILTERS
}

/// Split an expression on single `|` characters outside quotes and brackets.
/// `||` is left alone.
pub(crate) fn split_pipes(expression: &str) -> Vec<&str> {
	split_outside(expression, b'|', true)
}

/// Split `name:arg,arg` into the filter name and its raw argument texts.
pub(crate) fn parse_filter(segment: &str) -> (&str, Vec<&str>) {
	let segment = segment.trim();
	let parts = split_outside(segment, b':', false);
	let name: &str = parts.first().copied().unwrap_or_default();
	if parts.len() < 2 {
		return (name.trim(), Vec::new());
	}

	let arguments = split_outside(&segment[name.len() + 1..], b',', false)
		.into_iter()
		.map(str::trim)
		.filter(|argument| !argument.is_empty())
		.collect();
	(name.trim(), arguments)
}

/// Split on `separator` wherever it appears outside quotes, brackets and
/// parentheses. With `single_only`, doubled separators are not split.
fn split_outside(text: &str, separator: u8, single_only: bool) -> Vec<&str> {
	let bytes = text.as_bytes();
	let mut parts = Vec::new();
	let mut quote: Option<u8> = None;
	let mut depth: usize = 0;
	let mut start = 0;
	let mut index = 0;

	while index < bytes.len() {
		let byte = bytes[index];
		match quote {
			Some(open) => {
				if byte == b'\\' {
					index += 1;
				} else if byte == open {
					quote = None;
				}
			}
			None => {
				match byte {
					b'"' | b'\'' => quote = Some(byte),
					b'[' | b'(' => depth += 1,
					b']' | b')' => depth = depth.saturating_sub(1),
					_ if byte == separator && depth == 0 => {
						if single_only && bytes.get(index + 1) == Some(&separator) {
							index += 2;
							continue;
						}
						parts.push(&text[start..index]);
						start = index + 1;
					}
					_ => {}
				}
			}
		}
		index += 1;
	}

	parts.push(&text[start..]);
	parts
}
