use std::path::Path;

use crate::ComponentLoader;
use crate::Engine;
use crate::EngineConfig;
use crate::MemoryLoader;
use crate::Object;
use crate::Value;
use crate::ValueKind;
use crate::Variables;

/// Bindings built from the entries of a JSON object.
pub(crate) fn variables(value: serde_json::Value) -> Variables {
	match value {
		serde_json::Value::Object(entries) => {
			entries
				.into_iter()
				.map(|(name, value)| (name, Value::from(value)))
				.collect()
		}
		_ => Variables::new(),
	}
}

/// An in-memory loader holding the given `(path, source)` templates.
pub(crate) fn memory_loader(templates: &[(&str, &str)]) -> MemoryLoader {
	let loader = MemoryLoader::new();
	for (path, source) in templates {
		loader
			.insert(path, source)
			.unwrap_or_else(|e| panic!("insert {path}: {e}"));
	}
	loader
}

/// An engine with default settings loading components from memory.
pub(crate) fn engine_with_components(templates: &[(&str, &str)]) -> Engine {
	Engine::default().with_loader(memory_loader(templates))
}

pub(crate) fn engine_with_loader(config: EngineConfig, loader: impl ComponentLoader + 'static) -> Engine {
	Engine::new(config).with_loader(loader)
}

/// An engine whose pages and components live in `root`.
pub(crate) fn file_engine(root: &Path) -> Engine {
	Engine::new(EngineConfig::default().with_template_root(root))
}

pub(crate) fn write_file(root: &Path, relative: &str, content: &str) {
	let path = root.join(relative);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create dir: {e}"));
	}
	std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {relative}: {e}"));
}

/// Push the modification time of `relative` forward so the change is
/// visible even on file systems with coarse timestamps.
pub(crate) fn touch_later(root: &Path, relative: &str, seconds: u64) {
	let file = std::fs::OpenOptions::new()
		.write(true)
		.open(root.join(relative))
		.unwrap_or_else(|e| panic!("open {relative}: {e}"));
	let modified = std::time::SystemTime::now() + std::time::Duration::from_secs(seconds);
	file.set_modified(modified)
		.unwrap_or_else(|e| panic!("set modified: {e}"));
}

/// A host object with two stored fields, one computed property and an
/// integer indexer.
#[derive(Debug)]
pub(crate) struct Account {
	pub name: String,
	pub visits: i64,
	pub password: String,
}

impl Object for Account {
	fn fields(&self) -> &'static [&'static str] {
		&["Name", "Visits", "Password"]
	}

	fn field(&self, index: usize) -> Option<Value> {
		match index {
			0 => Some(Value::from(self.name.as_str())),
			1 => Some(Value::from(self.visits)),
			2 => Some(Value::from(self.password.as_str())),
			_ => None,
		}
	}

	fn property(&self, name: &str) -> Option<Value> {
		name.eq_ignore_ascii_case("Greeting")
			.then(|| Value::from(format!("Hello, {}", self.name)))
	}

	fn supports_index(&self, kind: ValueKind) -> bool {
		kind == ValueKind::Int
	}

	fn index(&self, key: &Value) -> Option<Value> {
		match key {
			Value::Int(0) => Some(Value::from(self.name.as_str())),
			Value::Int(1) => Some(Value::from(self.visits)),
			_ => None,
		}
	}
}

pub(crate) fn account() -> Value {
	Value::object(Account {
		name: "Ada".to_string(),
		visits: 3,
		password: "hunter2".to_string(),
	})
}

/// A three level `{Name, Children}` tree: Root > Branch > Leaf.
pub(crate) fn three_level_tree() -> serde_json::Value {
	serde_json::json!({
		"Name": "Root",
		"Children": [{
			"Name": "Branch",
			"Children": [{ "Name": "Leaf", "Children": [] }]
		}]
	})
}
