use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum TesseraError {
	#[error(transparent)]
	#[diagnostic(code(tessera::io_error))]
	Io(#[from] std::io::Error),

	#[error("unsafe expression `{expression}`: {reason}")]
	#[diagnostic(
		code(tessera::unsafe_expression),
		help("expressions may only reference bound variables, members, indexers and filters")
	)]
	UnsafeExpression { expression: String, reason: String },

	#[error("unsafe condition `{condition}`: {reason}")]
	#[diagnostic(
		code(tessera::unsafe_condition),
		help("use `==` for comparisons; assignments are not allowed in conditions")
	)]
	UnsafeCondition { condition: String, reason: String },

	#[error("unsafe property path `{path}`: {reason}")]
	#[diagnostic(code(tessera::unsafe_property_path))]
	UnsafePropertyPath { path: String, reason: String },

	#[error("unsafe file path `{path}`: {reason}")]
	#[diagnostic(
		code(tessera::unsafe_file_path),
		help("template files must live below a configured `allowed_roots` directory")
	)]
	UnsafeFilePath { path: String, reason: String },

	#[error("template rejected near `{fragment}`: {reason}")]
	#[diagnostic(
		code(tessera::unsafe_template),
		help("inline scripts and event handler attributes are disabled by `allow_inline_scripts`")
	)]
	UnsafeTemplate { fragment: String, reason: String },

	#[error("limit `{limit}` exceeded: configured {configured}, got {actual}")]
	#[diagnostic(
		code(tessera::limit_exceeded),
		help("raise the limit in the `[security.limits]` section of tessera.toml")
	)]
	LimitExceeded {
		limit: &'static str,
		configured: usize,
		actual: usize,
	},

	#[error("template not found: `{path}`")]
	#[diagnostic(
		code(tessera::template_not_found),
		help("tried the path as given, then `<path>.html`, then `<path>/default.html`")
	)]
	TemplateNotFound { path: String },

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(tessera::config_parse),
		help("check that tessera.toml is valid TOML with [paths], [security] and [cache] sections")
	)]
	ConfigParse(String),
}

impl TesseraError {
	/// Returns true for failures raised by the security gate.
	pub fn is_security_violation(&self) -> bool {
		matches!(
			self,
			Self::UnsafeExpression { .. }
				| Self::UnsafeCondition { .. }
				| Self::UnsafePropertyPath { .. }
				| Self::UnsafeFilePath { .. }
				| Self::UnsafeTemplate { .. }
		)
	}

	/// Returns true for resource-limit failures.
	pub fn is_limit_violation(&self) -> bool {
		matches!(self, Self::LimitExceeded { .. })
	}

	pub(crate) fn limit(limit: &'static str, configured: usize, actual: usize) -> Self {
		Self::LimitExceeded {
			limit,
			configured,
			actual,
		}
	}
}

pub type TesseraResult<T> = Result<T, TesseraError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
