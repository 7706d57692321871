//! Member and indexer resolution against template values.
//!
//! Member access on host objects is compiled once per `(type, member)` pair
//! into an [`Accessor`] and reused on every later lookup. The cache is keyed
//! by shape only, so it never needs invalidating when data changes; it is
//! cleared only by [`reset_accessor_cache`].

use std::any::TypeId;
use std::sync::Arc;
use std::sync::LazyLock;

use crate::Object;
use crate::Value;
use crate::ValueKind;
use crate::config::SecurityConfig;
use crate::shard::ShardedMap;

/// How a member name maps onto a concrete host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accessor {
	/// A stored field, by position in [`Object::fields`].
	Field(usize),
	/// Anything else is served by [`Object::property`].
	Property,
}

static ACCESSORS: LazyLock<ShardedMap<(TypeId, String), Accessor>> =
	LazyLock::new(ShardedMap::new);
static INDEXERS: LazyLock<ShardedMap<(TypeId, ValueKind), bool>> =
	LazyLock::new(ShardedMap::new);

/// Drop every compiled accessor and indexer decision.
pub fn reset_accessor_cache() {
	ACCESSORS.clear();
	INDEXERS.clear();
}

/// Number of compiled `(type, member)` accessors.
pub fn accessor_cache_len() -> usize {
	ACCESSORS.len()
}

/// Resolve a single member of `target`.
///
/// Maps are looked up by exact key, then by a case-insensitive scan. Lists,
/// strings and maps expose `Count` and `Length`. Returns `None` when the
/// member does not exist.
pub fn resolve_member(target: &Value, name: &str) -> Option<Value> {
	match target {
		Value::Map(entries) => {
			entries
				.get(name)
				.or_else(|| {
					entries
						.iter()
						.find(|(key, _)| key.eq_ignore_ascii_case(name))
						.map(|(_, value)| value)
				})
				.cloned()
				.or_else(|| is_count(name).then(|| Value::from(entries.len())))
		}
		Value::List(items) if is_count(name) => Some(Value::from(items.len())),
		Value::String(text) if is_count(name) => Some(Value::from(text.chars().count())),
		Value::Object(object) => resolve_object_member(object, name),
		_ => None,
	}
}

fn is_count(name: &str) -> bool {
	name.eq_ignore_ascii_case("count") || name.eq_ignore_ascii_case("length")
}

fn resolve_object_member(object: &Arc<dyn Object>, name: &str) -> Option<Value> {
	let key = (object.type_key(), name.to_string());
	let accessor = ACCESSORS.get_or_insert_with(key, || compile_accessor(object.as_ref(), name));

	match accessor {
		Accessor::Field(index) => object.field(index),
		Accessor::Property => object.property(name),
	}
}

fn compile_accessor(object: &dyn Object, name: &str) -> Accessor {
	let fields = object.fields();
	fields
		.iter()
		.position(|field| *field == name)
		.or_else(|| fields.iter().position(|field| field.eq_ignore_ascii_case(name)))
		.map_or(Accessor::Property, Accessor::Field)
}

/// Resolve `target[index]`.
///
/// Lists accept integer indexes, maps are keyed by the index rendered as
/// text, and host objects fall back to their generic single-argument
/// indexer.
pub fn resolve_index(target: &Value, index: &Value) -> Option<Value> {
	match target {
		Value::List(items) => {
			let position = index.as_f64()?;
			if position < 0.0 || position.fract() != 0.0 {
				return None;
			}
			#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			let position = position as usize;
			items.get(position).cloned()
		}
		Value::Map(_) => {
			let key = index.to_string();
			resolve_member_exact_first(target, &key)
		}
		Value::Object(object) => {
			let key = (object.type_key(), index.kind());
			let supported =
				INDEXERS.get_or_insert_with(key, || object.supports_index(index.kind()));
			if supported { object.index(index) } else { None }
		}
		_ => None,
	}
}

fn resolve_member_exact_first(target: &Value, key: &str) -> Option<Value> {
	match target {
		Value::Map(entries) => {
			entries
				.get(key)
				.or_else(|| {
					entries
						.iter()
						.find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
						.map(|(_, value)| value)
				})
				.cloned()
		}
		_ => None,
	}
}

/// Walk `segments` as member accesses starting at `root`.
///
/// Resolution stops with `None` as soon as a segment is missing, null or a
/// blocked property name.
pub fn resolve_path<S: AsRef<str>>(
	root: &Value,
	segments: &[S],
	security: &SecurityConfig,
) -> Option<Value> {
	let mut current = root.clone();
	for segment in segments {
		let segment = segment.as_ref();
		if security.is_blocked(segment) || current.is_null() {
			return None;
		}
		current = resolve_member(&current, segment)?;
	}

	if current.is_null() { None } else { Some(current) }
}
