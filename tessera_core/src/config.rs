use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::TesseraError;
use crate::TesseraResult;

/// Supported config file locations in discovery order (highest precedence
/// first).
pub const CONFIG_FILE_CANDIDATES: [&str; 3] =
	["tessera.toml", ".tessera.toml", ".config/tessera.toml"];

/// Default maximum template size in bytes (1 MiB).
pub const DEFAULT_MAX_TEMPLATE_SIZE: usize = 1024 * 1024;

/// Configuration loaded from a `tessera.toml` file.
///
/// ```toml
/// [paths]
/// pages_dir = "pages"
/// components_dir = "components"
///
/// [security]
/// allowed_roots = ["pages", "components"]
/// blocked_property_names = ["password", "apiKey"]
///
/// [security.limits]
/// max_loop_iterations = 5000
///
/// [cache]
/// max_templates = 500
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	/// Base directories used to resolve page and component paths.
	pub paths: PathsConfig,
	/// Settings for the security gate.
	pub security: SecurityConfig,
	/// Capacity settings for the in-memory caches.
	pub cache: CacheConfig,
}

impl EngineConfig {
	/// Load the configuration from the first config file found under `root`.
	///
	/// Returns `Ok(None)` when no candidate exists. Relative directories in the
	/// file are resolved against `root`.
	pub fn load(root: &Path) -> TesseraResult<Option<Self>> {
		let Some(path) = CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|candidate| candidate.is_file())
		else {
			return Ok(None);
		};

		let content = std::fs::read_to_string(&path)?;
		let mut config = Self::from_toml_str(&content)?;
		config.resolve_relative_to(root);

		Ok(Some(config))
	}

	/// Parse a configuration from TOML text without touching the file system.
	pub fn from_toml_str(content: &str) -> TesseraResult<Self> {
		toml::from_str(content).map_err(|e| TesseraError::ConfigParse(e.to_string()))
	}

	/// Use `root` as both the page and component directory and allow file
	/// access below it.
	#[must_use]
	pub fn with_template_root(mut self, root: impl Into<PathBuf>) -> Self {
		let root = root.into();
		self.paths.pages_dir.clone_from(&root);
		self.paths.components_dir.clone_from(&root);
		if !self.security.allowed_roots.contains(&root) {
			self.security.allowed_roots.push(root);
		}
		self
	}

	fn resolve_relative_to(&mut self, root: &Path) {
		let absolutize = |path: &mut PathBuf| {
			if path.is_relative() {
				*path = root.join(&*path);
			}
		};

		absolutize(&mut self.paths.pages_dir);
		absolutize(&mut self.paths.components_dir);
		self.security.allowed_roots.iter_mut().for_each(absolutize);
	}
}

/// Base directories for page and component lookups.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
	/// Directory used by `render_file(.., is_page = true)` for relative paths.
	pub pages_dir: PathBuf,
	/// Directory used for components, layouts and non-page renders.
	pub components_dir: PathBuf,
}

impl Default for PathsConfig {
	fn default() -> Self {
		Self {
			pages_dir: PathBuf::from("."),
			components_dir: PathBuf::from("."),
		}
	}
}

/// Settings consulted by the security gate before any externally influenced
/// string is acted upon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
	/// Longest expression accepted, in bytes.
	pub max_expression_length: usize,
	/// Function names that may appear in call position, e.g. `format(x)`.
	pub allowed_functions: Vec<String>,
	/// Whether `a[b]` indexer syntax is accepted in expressions.
	pub allow_indexers: bool,
	/// Member names that are never resolved, whatever object owns them.
	/// Compared case-insensitively.
	pub blocked_property_names: Vec<String>,
	/// Maximum number of segments in a dotted property path.
	pub max_property_depth: usize,
	/// Directories that template files must descend from. Empty denies all
	/// file access.
	pub allowed_roots: Vec<PathBuf>,
	/// File extensions (without the dot) accepted for template files.
	pub allowed_extensions: Vec<String>,
	/// How interpolated values are encoded.
	pub encoding: OutputEncoding,
	/// When false, templates containing `<script` or `on*=` attributes are
	/// rejected.
	pub allow_inline_scripts: bool,
	/// Resource limits enforced while validating and evaluating templates.
	pub limits: Limits,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		Self {
			max_expression_length: 1000,
			allowed_functions: Vec::new(),
			allow_indexers: true,
			blocked_property_names: [
				"password",
				"passwordHash",
				"passwordSalt",
				"securityStamp",
				"connectionString",
				"apiKey",
				"secret",
				"secretKey",
				"privateKey",
				"accessToken",
				"refreshToken",
				"creditCardNumber",
			]
			.into_iter()
			.map(String::from)
			.collect(),
			max_property_depth: 10,
			allowed_roots: Vec::new(),
			allowed_extensions: vec!["html".to_string(), "htm".to_string()],
			encoding: OutputEncoding::default(),
			allow_inline_scripts: false,
			limits: Limits::default(),
		}
	}
}

impl SecurityConfig {
	/// Returns true when `name` matches a blocked property name.
	pub fn is_blocked(&self, name: &str) -> bool {
		self.blocked_property_names
			.iter()
			.any(|blocked| blocked.eq_ignore_ascii_case(name))
	}
}

/// Output encoding applied to every interpolated value.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct OutputEncoding {
	/// Escape `& < > " '` as HTML entities.
	pub html_encode: bool,
	/// Remove anything that looks like a markup tag before encoding.
	pub strip_tags: bool,
	/// Additionally escape for embedding inside a script string literal.
	pub script_encode: bool,
}

impl Default for OutputEncoding {
	fn default() -> Self {
		Self {
			html_encode: true,
			strip_tags: false,
			script_encode: false,
		}
	}
}

/// Deterministic resource limits. These are the only termination mechanism
/// for pathological templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
	/// Largest template body accepted, in bytes.
	pub max_template_size: usize,
	/// Largest number of `{{ }}` spans in one template body.
	pub max_interpolations: usize,
	/// Deepest tag nesting accepted in one template body.
	pub max_nesting_depth: usize,
	/// Loop iterations that may be active at once within one render.
	pub max_loop_iterations: usize,
	/// Fragment invocations that may be active at once within one render.
	pub max_recursion_depth: usize,
	/// Deepest component inclusion chain.
	pub max_include_depth: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_template_size: DEFAULT_MAX_TEMPLATE_SIZE,
			max_interpolations: 10_000,
			max_nesting_depth: 100,
			max_loop_iterations: 10_000,
			max_recursion_depth: 50,
			max_include_depth: 10,
		}
	}
}

/// Capacity settings for the engine caches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Parsed trees kept before the least recently used fifth is evicted.
	pub max_templates: usize,
	/// Rendered outputs kept before the least recently used fifth is evicted.
	pub max_outputs: usize,
	/// Templates up to this many bytes are keyed by their literal text
	/// instead of a digest.
	pub literal_key_threshold: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_templates: 1000,
			max_outputs: 1000,
			literal_key_threshold: 256,
		}
	}
}
