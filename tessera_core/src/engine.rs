use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::EngineConfig;
use crate::TesseraError;
use crate::TesseraResult;
use crate::Value;
use crate::Variables;
use crate::ast::Root;
use crate::cache::EngineCacheStats;
use crate::cache::OutputCache;
use crate::cache::OutputEntry;
use crate::cache::SourceCache;
use crate::cache::TemplateKey;
use crate::cache::TreeCache;
use crate::component::ComponentDescriptor;
use crate::component::ComponentHooks;
use crate::component::ComponentLoader;
use crate::evaluator::Budget;
use crate::evaluator::RenderContext;
use crate::evaluator::render_tree;
use crate::filters::FilterRegistry;
use crate::globals::globals_snapshot;
use crate::lexer::scan;
use crate::parser::parse;
use crate::security::validate_file_path;
use crate::security::validate_template;
use crate::variables::SharedVariables;

/// The file name tried inside a directory when a template path names one.
pub const DEFAULT_TEMPLATE_FILE: &str = "default.html";

/// A template that has been validated and parsed ahead of rendering.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedTemplate {
	/// Key of the parsed tree in the engine's tree cache.
	pub cache_key: TemplateKey,
	/// Paths of every component the template references.
	pub component_refs: Vec<String>,
	#[serde(skip)]
	pub tree: Arc<Root>,
}

#[derive(Debug)]
struct Caches {
	trees: TreeCache,
	sources: SourceCache,
	outputs: OutputCache,
}

/// Compiles and renders templates.
///
/// Variables are layered per render: process-wide globals first, then the
/// engine's instance variables, then the bindings passed to the call. Later
/// layers shadow earlier ones.
pub struct Engine {
	config: EngineConfig,
	variables: SharedVariables,
	filters: FilterRegistry,
	loader: Option<Arc<dyn ComponentLoader>>,
	hooks: ComponentHooks,
	caches: Caches,
}

impl fmt::Debug for Engine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Engine")
			.field("config", &self.config)
			.field("variables", &self.variables.lock().len())
			.field("filters", &self.filters)
			.field("custom_loader", &self.loader.is_some())
			.field("hooks", &self.hooks)
			.finish_non_exhaustive()
	}
}

impl Default for Engine {
	fn default() -> Self {
		Self::new(EngineConfig::default())
	}
}

impl Engine {
	pub fn new(config: EngineConfig) -> Self {
		let caches = Caches {
			trees: TreeCache::new(config.cache.max_templates),
			sources: SourceCache::default(),
			outputs: OutputCache::new(config.cache.max_outputs),
		};

		Self {
			config,
			variables: Arc::new(Mutex::new(Variables::new())),
			filters: FilterRegistry::new(),
			loader: None,
			hooks: ComponentHooks::default(),
			caches,
		}
	}

	/// Create an engine for a project directory, using its config file when
	/// one exists and otherwise treating the directory as the template root.
	pub fn from_root(root: &Path) -> TesseraResult<Self> {
		let config = match EngineConfig::load(root)? {
			Some(config) => config,
			None => EngineConfig::default().with_template_root(root),
		};
		Ok(Self::new(config))
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Bind an instance variable. Blocked property names are rejected.
	pub fn set_variable(&self, name: impl Into<String>, value: impl Into<Value>) -> TesseraResult<()> {
		let name = name.into();
		if self.config.security.is_blocked(&name) {
			return Err(TesseraError::UnsafePropertyPath {
				path: name,
				reason: "blocked property names cannot be bound as variables".to_string(),
			});
		}
		self.variables.lock().insert(name, value);
		Ok(())
	}

	pub fn get_variable(&self, name: &str) -> Option<Value> {
		self.variables.lock().get(name).cloned()
	}

	pub fn remove_variable(&self, name: &str) -> Option<Value> {
		self.variables.lock().remove(name)
	}

	/// The instance variable store. Pre-render callbacks receive it mutably;
	/// it is restored after every component inclusion.
	pub fn variables(&self) -> SharedVariables {
		Arc::clone(&self.variables)
	}

	/// Register a filter for this engine only. It shadows a process-wide
	/// filter of the same name.
	pub fn register_filter(
		&self,
		name: impl AsRef<str>,
		filter: impl Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
	) {
		self.filters.register(name, filter);
	}

	pub fn filters(&self) -> &FilterRegistry {
		&self.filters
	}

	/// Replace the file-system loader used for components and layouts.
	pub fn set_loader(&mut self, loader: impl ComponentLoader + 'static) {
		self.loader = Some(Arc::new(loader));
	}

	#[must_use]
	pub fn with_loader(mut self, loader: impl ComponentLoader + 'static) -> Self {
		self.set_loader(loader);
		self
	}

	/// Run `callback` before every component renders. The callback must not
	/// call back into this engine's variable methods.
	pub fn on_before_component(
		&mut self,
		callback: impl Fn(&ComponentDescriptor, &mut Variables) + Send + Sync + 'static,
	) {
		self.hooks.before = Some(Arc::new(callback));
	}

	/// Run `callback` on the output of every component; its result replaces
	/// the output.
	pub fn on_after_component(
		&mut self,
		callback: impl Fn(&ComponentDescriptor, String) -> String + Send + Sync + 'static,
	) {
		self.hooks.after = Some(Arc::new(callback));
	}

	/// Render template text.
	pub fn render(&self, template: &str, extra: &Variables) -> TesseraResult<String> {
		let (_, tree) = self.compile(template)?;
		self.render_tree(&tree, extra)
	}

	/// Render a template file.
	///
	/// Relative paths resolve against the pages directory when `is_page` is
	/// set and the components directory otherwise. The path is tried as given
	/// when it has an extension, then with `.html` appended, then as a
	/// directory containing `default.html`.
	pub fn render_file(
		&self,
		path: impl AsRef<Path>,
		extra: &Variables,
		is_page: bool,
	) -> TesseraResult<String> {
		let resolved = self.resolve_template_path(path.as_ref(), is_page)?;
		let (tree, _) = self.load_file_tree(&resolved)?;
		self.render_tree(&tree, extra)
	}

	/// Render a page through the output cache.
	///
	/// `cache_key` identifies the output. With `data_aware` the key is
	/// combined with a digest of the current bindings so different data never
	/// shares an entry. A cached entry is used only while it has not expired
	/// and the file has not been modified since it was rendered.
	pub fn render_cached_file(
		&self,
		path: impl AsRef<Path>,
		cache_key: &str,
		expiry: Option<SystemTime>,
		data_aware: bool,
		extra: &Variables,
	) -> TesseraResult<String> {
		let resolved = self.resolve_template_path(path.as_ref(), true)?;
		let key = if data_aware {
			format!("{cache_key}::{}", self.environment(extra).fingerprint())
		} else {
			cache_key.to_string()
		};

		let modified = std::fs::metadata(&resolved)
			.and_then(|metadata| metadata.modified())
			.ok();
		if modified.is_some() {
			if let Some(text) = self.caches.outputs.get(&key, modified) {
				debug!(key = %key, "output cache hit");
				return Ok(text.to_string());
			}
		}

		let (tree, source_modified) = self.load_file_tree(&resolved)?;
		let output = self.render_tree(&tree, extra)?;
		self.caches.outputs.insert(
			key,
			OutputEntry {
				text: Arc::from(output.as_str()),
				expires_at: expiry,
				source_modified: Some(source_modified),
			},
		);

		Ok(output)
	}

	/// Validate and parse template text without rendering it.
	pub fn prepare_template(&self, template: &str) -> TesseraResult<PreparedTemplate> {
		let (cache_key, tree) = self.compile(template)?;
		Ok(PreparedTemplate {
			cache_key,
			component_refs: tree.component_refs(),
			tree,
		})
	}

	pub fn render_prepared(
		&self,
		prepared: &PreparedTemplate,
		extra: &Variables,
	) -> TesseraResult<String> {
		self.render_tree(&prepared.tree, extra)
	}

	/// Drop one cached output. Returns true when an entry was removed.
	pub fn invalidate_output(&self, key: &str) -> bool {
		self.caches.outputs.invalidate(key)
	}

	/// Drop every cached output whose key starts with `prefix`, including
	/// data-aware entries derived from such keys.
	pub fn invalidate_output_prefix(&self, prefix: &str) -> usize {
		self.caches.outputs.invalidate_prefix(prefix)
	}

	/// Empty every cache and reset its counters.
	pub fn clear_caches(&self) {
		self.caches.trees.clear();
		self.caches.sources.clear();
		self.caches.outputs.clear();
	}

	pub fn cache_stats(&self) -> EngineCacheStats {
		EngineCacheStats {
			templates: self.caches.trees.stats(),
			sources: self.caches.sources.stats(),
			outputs: self.caches.outputs.stats(),
		}
	}

	/// Look up or build the tree for `source`. Validation runs only when the
	/// tree is not cached yet.
	fn compile(&self, source: &str) -> TesseraResult<(TemplateKey, Arc<Root>)> {
		let key = TemplateKey::for_source(source, self.config.cache.literal_key_threshold);
		if let Some(tree) = self.caches.trees.get(&key) {
			return Ok((key, tree));
		}

		validate_template(source, &self.config.security)?;
		let tree = Arc::new(parse(&scan(source)));
		self.caches.trees.insert(key.clone(), Arc::clone(&tree));
		debug!(bytes = source.len(), "compiled template");

		Ok((key, tree))
	}

	fn load_file_tree(&self, path: &Path) -> TesseraResult<(Arc<Root>, SystemTime)> {
		let loaded = self.caches.sources.load(path)?;
		if let Some(stale) = &loaded.stale {
			let stale_key = TemplateKey::for_source(stale, self.config.cache.literal_key_threshold);
			self.caches.trees.remove(&stale_key);
		}

		let (_, tree) = self.compile(&loaded.text)?;
		Ok((tree, loaded.modified))
	}

	fn resolve_template_path(&self, path: &Path, is_page: bool) -> TesseraResult<PathBuf> {
		let base = if is_page {
			&self.config.paths.pages_dir
		} else {
			&self.config.paths.components_dir
		};
		let joined = if path.is_absolute() {
			path.to_path_buf()
		} else {
			base.join(path)
		};

		let mut candidates = Vec::with_capacity(3);
		if joined.extension().is_some() {
			candidates.push(joined.clone());
		}
		let mut with_extension = joined.clone().into_os_string();
		with_extension.push(".html");
		candidates.push(PathBuf::from(with_extension));
		candidates.push(joined.join(DEFAULT_TEMPLATE_FILE));

		for candidate in candidates {
			let safe = validate_file_path(&candidate, &self.config.security)?;
			if safe.is_file() {
				return Ok(safe);
			}
		}

		Err(TesseraError::TemplateNotFound {
			path: path.display().to_string(),
		})
	}

	fn environment(&self, extra: &Variables) -> Variables {
		let globals = globals_snapshot();
		let instance = self.variables.lock().clone();
		Variables::layered([&globals, &instance, extra])
	}

	fn render_tree(&self, tree: &Root, extra: &Variables) -> TesseraResult<String> {
		let env = self.environment(extra);
		let budget = Budget::default();
		let file_loader = FileLoader { engine: self };
		let loader: &dyn ComponentLoader = match &self.loader {
			Some(loader) => loader.as_ref(),
			None => &file_loader,
		};

		let ctx = RenderContext {
			security: &self.config.security,
			filters: &self.filters,
			loader: Some(loader),
			hooks: &self.hooks,
			store: Some(&self.variables),
			budget: &budget,
		};

		render_tree(ctx, tree, env)
	}
}

/// Loads components from the components directory through the engine's
/// source and tree caches.
struct FileLoader<'e> {
	engine: &'e Engine,
}

impl ComponentLoader for FileLoader<'_> {
	fn load(&self, path: &str) -> TesseraResult<Option<Arc<Root>>> {
		let relative = path.trim().trim_start_matches('/');
		match self.engine.resolve_template_path(Path::new(relative), false) {
			Ok(resolved) => Ok(Some(self.engine.load_file_tree(&resolved)?.0)),
			Err(TesseraError::TemplateNotFound { .. }) => Ok(None),
			Err(error) => Err(error),
		}
	}
}
