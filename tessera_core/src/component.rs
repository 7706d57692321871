//! Component loading and the inclusion protocol.
//!
//! A component is an independently loaded template rendered with its own
//! environment. Hosts can observe and customize every inclusion through
//! [`ComponentHooks`]: the pre-render callback may write variables into the
//! engine's shared store for the duration of one inclusion, and the
//! post-render callback may replace the rendered text.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::TesseraResult;
use crate::Value;
use crate::Variables;
use crate::ast::ComponentRef;
use crate::ast::Parameter;
use crate::ast::Root;
use crate::config::SecurityConfig;
use crate::evaluator::Evaluator;
use crate::parser::DEFAULT_SLOT;
use crate::parser::parse_str;
use crate::security::validate_template;
use crate::variables::SharedVariables;

/// Variable bound to the instance name of the component being rendered.
pub const COMPONENT_NAME_VARIABLE: &str = "_ComponentName";
/// Variable bound to the legacy instance name of the component being rendered.
pub const COMPONENT_OLD_NAME_VARIABLE: &str = "_ComponentOldName";
/// Variable bound to the resolved path of the component being rendered.
pub const COMPONENT_PATH_VARIABLE: &str = "_ComponentPath";

const TECHNICAL_VARIABLES: [&str; 3] = [
	COMPONENT_NAME_VARIABLE,
	COMPONENT_OLD_NAME_VARIABLE,
	COMPONENT_PATH_VARIABLE,
];

/// What the include callbacks are told about a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentDescriptor {
	pub name: Option<String>,
	pub old_name: Option<String>,
	/// The resolved path handed to the loader.
	pub path: String,
	/// Parameters as written, before resolution.
	pub parameters: Vec<Parameter>,
}

/// Called before a component renders, with mutable access to the shared
/// variable store. Variables it changes outrank same-named parameters.
pub type PreRenderCallback = Arc<dyn Fn(&ComponentDescriptor, &mut Variables) + Send + Sync>;

/// Called with the rendered text of a component. The returned text replaces
/// it.
pub type PostRenderCallback = Arc<dyn Fn(&ComponentDescriptor, String) -> String + Send + Sync>;

#[derive(Clone, Default)]
pub struct ComponentHooks {
	pub before: Option<PreRenderCallback>,
	pub after: Option<PostRenderCallback>,
}

impl fmt::Debug for ComponentHooks {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ComponentHooks")
			.field("before", &self.before.is_some())
			.field("after", &self.after.is_some())
			.finish()
	}
}

/// Loads component and layout trees by path.
pub trait ComponentLoader: Send + Sync {
	/// Load the tree for `path`. `Ok(None)` means the component does not
	/// exist and renders as nothing.
	fn load(&self, path: &str) -> TesseraResult<Option<Arc<Root>>>;
}

/// Templates held in memory and parsed once when inserted.
///
/// Paths are matched ignoring case, surrounding slashes and a trailing
/// `.html`/`.htm` extension. A path with no match falls back to
/// `<path>/default`.
#[derive(Debug, Default)]
pub struct MemoryLoader {
	security: SecurityConfig,
	templates: RwLock<HashMap<String, Arc<Root>>>,
}

impl MemoryLoader {
	pub fn new() -> Self {
		Self::default()
	}

	/// Validate inserted templates against `security` instead of the default
	/// settings.
	pub fn with_security(security: SecurityConfig) -> Self {
		Self {
			security,
			templates: RwLock::default(),
		}
	}

	/// Validate, parse and store a template.
	pub fn insert(&self, path: &str, source: &str) -> TesseraResult<()> {
		validate_template(source, &self.security)?;
		let tree = Arc::new(parse_str(source));
		self.templates.write().insert(normalize(path), tree);
		Ok(())
	}

	/// Builder form of [`MemoryLoader::insert`].
	pub fn with(self, path: &str, source: &str) -> TesseraResult<Self> {
		self.insert(path, source)?;
		Ok(self)
	}

	pub fn remove(&self, path: &str) -> bool {
		self.templates.write().remove(&normalize(path)).is_some()
	}

	pub fn len(&self) -> usize {
		self.templates.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.templates.read().is_empty()
	}
}

impl ComponentLoader for MemoryLoader {
	fn load(&self, path: &str) -> TesseraResult<Option<Arc<Root>>> {
		let key = normalize(path);
		let templates = self.templates.read();
		Ok(templates
			.get(&key)
			.or_else(|| templates.get(&format!("{key}/default")))
			.cloned())
	}
}

fn normalize(path: &str) -> String {
	let path = path.trim().trim_matches('/').to_lowercase();
	for extension in [".html", ".htm"] {
		if let Some(stripped) = path.strip_suffix(extension) {
			return stripped.to_string();
		}
	}
	path
}

/// Restores the shared store to its snapshot when dropped.
struct StoreRestore<'s> {
	store: Option<&'s SharedVariables>,
	snapshot: Option<Variables>,
}

impl Drop for StoreRestore<'_> {
	fn drop(&mut self) {
		if let (Some(store), Some(snapshot)) = (self.store, self.snapshot.take()) {
			*store.lock() = snapshot;
		}
	}
}

impl<'a> Evaluator<'a> {
	/// Render a component reference. Failures inside the component are
	/// rendered as a diagnostic so the rest of the page continues.
	pub(crate) fn render_component(&mut self, component: &'a ComponentRef) -> TesseraResult<()> {
		let path = component.path();
		let max_depth = self.ctx.security.limits.max_include_depth;
		if self.include_depth >= max_depth {
			self.diagnostic(&format!(
				"component `{path}` exceeds the maximum include depth of {max_depth}"
			));
			return Ok(());
		}

		match self.include(component, &path) {
			Ok(output) => self.push_output(&output),
			Err(error) => self.diagnostic(&format!("component `{path}` failed: {error}")),
		}

		Ok(())
	}

	fn include(&mut self, component: &'a ComponentRef, raw_path: &str) -> TesseraResult<String> {
		let path = self.interpolate(raw_path)?;
		let name = self.interpolate_optional(component.name.as_deref())?;
		let old_name = self.interpolate_optional(component.old_name.as_deref())?;
		let descriptor = ComponentDescriptor {
			name,
			old_name,
			path,
			parameters: component.parameters.clone(),
		};

		let store = self.ctx.store;
		let _restore = StoreRestore {
			store,
			snapshot: store.map(|store| store.lock().clone()),
		};
		let callback_set = self.run_before_callback(&descriptor);

		let tree = match self.ctx.loader {
			Some(loader) => loader.load(&descriptor.path)?,
			None => None,
		};
		let Some(tree) = tree else {
			debug!(component = %descriptor.path, "component not found, rendering nothing");
			return Ok(String::new());
		};

		let mut env = self.env.clone();
		env.retain(|name, _| !is_technical(name));
		env.insert(
			COMPONENT_NAME_VARIABLE,
			Value::from(descriptor.name.clone()),
		);
		env.insert(
			COMPONENT_OLD_NAME_VARIABLE,
			Value::from(descriptor.old_name.clone()),
		);
		env.insert(COMPONENT_PATH_VARIABLE, descriptor.path.as_str());
		env.extend_from(&callback_set);
		for parameter in &component.parameters {
			if callback_set.contains(&parameter.name) {
				continue;
			}
			let value = self.resolve_parameter(parameter)?;
			env.insert(parameter.name.clone(), value);
		}

		let mut slots = HashMap::new();
		if !component.default_slot.is_empty() {
			slots.insert(DEFAULT_SLOT.to_string(), self.capture(&component.default_slot)?);
		}
		for (name, nodes) in &component.slots {
			slots.insert(name.to_lowercase(), self.capture(nodes)?);
		}

		let mut child = Evaluator::new(self.ctx, env, self.include_depth + 1);
		child.slots = slots;
		child.render_root(&tree)?;
		let mut output = child.finish();

		if let Some(after) = &self.ctx.hooks.after {
			output = after(&descriptor, output);
		}

		Ok(output)
	}

	/// Run the pre-render callback and return the variables it changed.
	fn run_before_callback(&self, descriptor: &ComponentDescriptor) -> Variables {
		let Some(before) = &self.ctx.hooks.before else {
			return Variables::new();
		};

		match self.ctx.store {
			Some(store) => {
				let mut variables = store.lock();
				let snapshot = variables.clone();
				before(descriptor, &mut variables);
				variables.changed_since(&snapshot)
			}
			None => {
				let mut scratch = Variables::new();
				before(descriptor, &mut scratch);
				scratch
			}
		}
	}

	fn interpolate_optional(&self, text: Option<&str>) -> TesseraResult<Option<String>> {
		text.map(|text| self.interpolate(text)).transpose()
	}
}

fn is_technical(name: &str) -> bool {
	TECHNICAL_VARIABLES
		.iter()
		.any(|technical| technical.eq_ignore_ascii_case(name))
}
