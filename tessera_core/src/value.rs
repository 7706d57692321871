use std::any::TypeId;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use float_cmp::approx_eq;
use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeMap;
use serde::ser::SerializeSeq;

/// A value bound to a template variable or produced while evaluating an
/// expression.
///
/// Containers are reference counted so that copying an environment for a
/// component or fragment call is cheap.
#[derive(Clone, Default)]
pub enum Value {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(Arc<str>),
	List(Arc<Vec<Value>>),
	Map(Arc<BTreeMap<String, Value>>),
	/// A host object resolved through the [`Object`] trait.
	Object(Arc<dyn Object>),
}

/// The shape of a [`Value`], used as part of indexer cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
	Null,
	Bool,
	Int,
	Float,
	String,
	List,
	Map,
	Object,
}

/// A host object that templates can read members from.
///
/// Implementations describe their stored fields once through [`fields`] and
/// hand out values by position through [`field`]. The resolver compiles a
/// member name to a field position on first access for each concrete type and
/// reuses it afterwards. Anything that is not a stored field can be served
/// from [`property`].
///
/// ```rust
/// use tessera_core::Object;
/// use tessera_core::Value;
///
/// #[derive(Debug)]
/// struct User {
/// 	name: String,
/// 	age: i64,
/// }
///
/// impl Object for User {
/// 	fn fields(&self) -> &'static [&'static str] {
/// 		&["Name", "Age"]
/// 	}
///
/// 	fn field(&self, index: usize) -> Option<Value> {
/// 		match index {
/// 			0 => Some(Value::from(self.name.as_str())),
/// 			1 => Some(Value::from(self.age)),
/// 			_ => None,
/// 		}
/// 	}
/// }
/// ```
///
/// [`fields`]: Object::fields
/// [`field`]: Object::field
/// [`property`]: Object::property
pub trait Object: fmt::Debug + Send + Sync + 'static {
	/// Identity of the concrete type, used to key the accessor cache.
	fn type_key(&self) -> TypeId {
		TypeId::of::<Self>()
	}

	/// Human readable type name.
	fn type_name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}

	/// Names of the stored fields, in the order used by [`Object::field`].
	fn fields(&self) -> &'static [&'static str] {
		&[]
	}

	/// The value of the field at `index` in [`Object::fields`].
	fn field(&self, _index: usize) -> Option<Value> {
		None
	}

	/// A computed member looked up after the stored fields.
	fn property(&self, _name: &str) -> Option<Value> {
		None
	}

	/// Whether [`Object::index`] accepts keys of the given kind.
	fn supports_index(&self, _kind: ValueKind) -> bool {
		false
	}

	/// Single-argument indexer, e.g. `obj["key"]`.
	fn index(&self, _key: &Value) -> Option<Value> {
		None
	}

	/// Enumerate the object when it is used as a loop collection.
	fn iter(&self) -> Option<Box<dyn Iterator<Item = Value> + '_>> {
		None
	}

	/// Text used when the object itself is interpolated.
	fn render(&self) -> String {
		self.type_name().to_string()
	}
}

impl Value {
	/// Wrap a host object.
	pub fn object(object: impl Object) -> Self {
		Self::Object(Arc::new(object))
	}

	/// Convert any serializable host value into a template value. Structs
	/// become maps keyed by their serialized field names.
	pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Self {
		serde_json::to_value(value).map_or(Self::Null, Self::from)
	}

	pub fn kind(&self) -> ValueKind {
		match self {
			Self::Null => ValueKind::Null,
			Self::Bool(_) => ValueKind::Bool,
			Self::Int(_) => ValueKind::Int,
			Self::Float(_) => ValueKind::Float,
			Self::String(_) => ValueKind::String,
			Self::List(_) => ValueKind::List,
			Self::Map(_) => ValueKind::Map,
			Self::Object(_) => ValueKind::Object,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(value) => Some(value),
			_ => None,
		}
	}

	/// Numeric view of the value. Strings that parse as numbers count.
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Int(value) => Some(*value as f64),
			Self::Float(value) => Some(*value),
			Self::String(value) => value.trim().parse().ok(),
			_ => None,
		}
	}

	/// Whether the value renders as nothing: null or an empty string.
	pub fn is_empty_text(&self) -> bool {
		match self {
			Self::Null => true,
			Self::String(value) => value.is_empty(),
			_ => false,
		}
	}

	/// Truthiness used by conditionals.
	///
	/// - null is false
	/// - booleans are themselves
	/// - numbers are true when nonzero
	/// - strings are false when empty or equal (ignoring case) to `"false"`,
	///   `"null"` or `"0"`
	/// - lists, maps and enumerable objects are true when they yield at least
	///   one element
	/// - anything else is true
	pub fn is_truthy(&self) -> bool {
		match self {
			Self::Null => false,
			Self::Bool(value) => *value,
			Self::Int(value) => *value != 0,
			Self::Float(value) => *value != 0.0 && !value.is_nan(),
			Self::String(value) => {
				!(value.is_empty()
					|| value.eq_ignore_ascii_case("false")
					|| value.eq_ignore_ascii_case("null")
					|| value.as_ref() == "0")
			}
			Self::List(items) => !items.is_empty(),
			Self::Map(entries) => !entries.is_empty(),
			Self::Object(object) => {
				match object.iter() {
					Some(mut iter) => iter.next().is_some(),
					None => true,
				}
			}
		}
	}

	/// Iterate the value as a loop collection. Returns `None` for values that
	/// are not enumerable. Map entries are yielded as `{Key, Value}` maps.
	pub fn try_iter(&self) -> Option<Box<dyn Iterator<Item = Value> + '_>> {
		match self {
			Self::List(items) => Some(Box::new(items.iter().cloned())),
			Self::Map(entries) => {
				Some(Box::new(entries.iter().map(|(key, value)| {
					let mut entry = BTreeMap::new();
					entry.insert("Key".to_string(), Self::from(key.as_str()));
					entry.insert("Value".to_string(), value.clone());
					Self::Map(Arc::new(entry))
				})))
			}
			Self::Object(object) => object.iter(),
			_ => None,
		}
	}

	/// Strip one redundant layer of matching quotes from a string value.
	#[must_use]
	pub fn unwrap_quoted(self) -> Self {
		if let Self::String(text) = &self {
			let bytes = text.as_bytes();
			if bytes.len() >= 2 {
				let first = bytes[0];
				if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
					return Self::from(&text[1..text.len() - 1]);
				}
			}
		}

		self
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => Ok(()),
			Self::Bool(value) => write!(f, "{value}"),
			Self::Int(value) => write!(f, "{value}"),
			Self::Float(value) => write!(f, "{value}"),
			Self::String(value) => f.write_str(value),
			Self::List(items) => {
				for (index, item) in items.iter().enumerate() {
					if index > 0 {
						f.write_str(", ")?;
					}
					write!(f, "{item}")?;
				}
				Ok(())
			}
			Self::Map(_) => {
				let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
				f.write_str(&json)
			}
			Self::Object(object) => f.write_str(&object.render()),
		}
	}
}

impl fmt::Debug for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => f.write_str("Null"),
			Self::Bool(value) => write!(f, "{value:?}"),
			Self::Int(value) => write!(f, "{value:?}"),
			Self::Float(value) => write!(f, "{value:?}"),
			Self::String(value) => write!(f, "{value:?}"),
			Self::List(items) => f.debug_list().entries(items.iter()).finish(),
			Self::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
			Self::Object(object) => write!(f, "{object:?}"),
		}
	}
}

impl PartialEq for Value {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Null, Self::Null) => true,
			(Self::Bool(left), Self::Bool(right)) => left == right,
			(Self::Int(left), Self::Int(right)) => left == right,
			(Self::Float(_) | Self::Int(_), Self::Float(_) | Self::Int(_)) => {
				match (self.as_f64(), other.as_f64()) {
					(Some(left), Some(right)) => approx_eq!(f64, left, right, ulps = 2),
					_ => false,
				}
			}
			(Self::String(left), Self::String(right)) => left == right,
			(Self::List(left), Self::List(right)) => left == right,
			(Self::Map(left), Self::Map(right)) => left == right,
			(Self::Object(left), Self::Object(right)) => Arc::ptr_eq(left, right),
			_ => false,
		}
	}
}

impl Serialize for Value {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Self::Null => serializer.serialize_unit(),
			Self::Bool(value) => serializer.serialize_bool(*value),
			Self::Int(value) => serializer.serialize_i64(*value),
			Self::Float(value) => serializer.serialize_f64(*value),
			Self::String(value) => serializer.serialize_str(value),
			Self::List(items) => {
				let mut seq = serializer.serialize_seq(Some(items.len()))?;
				for item in items.iter() {
					seq.serialize_element(item)?;
				}
				seq.end()
			}
			Self::Map(entries) => {
				let mut map = serializer.serialize_map(Some(entries.len()))?;
				for (key, value) in entries.iter() {
					map.serialize_entry(key, value)?;
				}
				map.end()
			}
			Self::Object(object) => {
				let names = object.fields();
				let mut map = serializer.serialize_map(Some(names.len()))?;
				for (index, name) in names.iter().enumerate() {
					map.serialize_entry(name, &object.field(index).unwrap_or_default())?;
				}
				map.end()
			}
		}
	}
}

impl From<serde_json::Value> for Value {
	fn from(value: serde_json::Value) -> Self {
		match value {
			serde_json::Value::Null => Self::Null,
			serde_json::Value::Bool(value) => Self::Bool(value),
			serde_json::Value::Number(number) => {
				number
					.as_i64()
					.map(Self::Int)
					.or_else(|| number.as_f64().map(Self::Float))
					.unwrap_or_default()
			}
			serde_json::Value::String(value) => Self::from(value),
			serde_json::Value::Array(items) => {
				Self::List(Arc::new(items.into_iter().map(Self::from).collect()))
			}
			serde_json::Value::Object(entries) => {
				Self::Map(Arc::new(
					entries
						.into_iter()
						.map(|(key, value)| (key, Self::from(value)))
						.collect(),
				))
			}
		}
	}
}

impl From<bool> for Value {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

impl From<i32> for Value {
	fn from(value: i32) -> Self {
		Self::Int(i64::from(value))
	}
}

impl From<i64> for Value {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<u32> for Value {
	fn from(value: u32) -> Self {
		Self::Int(i64::from(value))
	}
}

impl From<usize> for Value {
	fn from(value: usize) -> Self {
		Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
	}
}

impl From<f64> for Value {
	fn from(value: f64) -> Self {
		Self::Float(value)
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Self::String(Arc::from(value))
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Self::String(Arc::from(value))
	}
}

impl<T: Into<Value>> From<Vec<T>> for Value {
	fn from(items: Vec<T>) -> Self {
		Self::List(Arc::new(items.into_iter().map(Into::into).collect()))
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map_or(Self::Null, Into::into)
	}
}

impl From<BTreeMap<String, Value>> for Value {
	fn from(entries: BTreeMap<String, Value>) -> Self {
		Self::Map(Arc::new(entries))
	}
}

impl<V: Into<Value>, S: std::hash::BuildHasher> From<HashMap<String, V, S>> for Value {
	fn from(entries: HashMap<String, V, S>) -> Self {
		Self::Map(Arc::new(
			entries
				.into_iter()
				.map(|(key, value)| (key, value.into()))
				.collect(),
		))
	}
}

impl<T: Object> From<Arc<T>> for Value {
	fn from(object: Arc<T>) -> Self {
		Self::Object(object)
	}
}
