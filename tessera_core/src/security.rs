//! Stateless validators consulted before any externally influenced string is
//! acted upon.
//!
//! Every rejection is a distinct [`TesseraError`] variant carrying the
//! offending text, and limit failures carry the limit name with its
//! configured and actual values. Nothing here retries or swallows a failure.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::TesseraError;
use crate::TesseraResult;
use crate::config::OutputEncoding;
use crate::config::SecurityConfig;
use crate::lexer::find_tag_end;
use crate::lexer::memstr;

/// Fragments of host APIs and injection markers that never belong in a
/// template expression. Matched ignoring case; entries starting with a letter
/// only match at the start of an identifier.
const DENIED_FRAGMENTS: [&str; 26] = [
	"system.",
	"process.",
	"file.",
	"directory.",
	"reflection.",
	"assembly.",
	"activator.",
	"gettype(",
	"typeof(",
	"environment.",
	"socket",
	"httpclient",
	"webclient",
	"sqlconnection",
	"sqlcommand",
	"dbcontext",
	"eval(",
	"exec(",
	"<script",
	"javascript:",
	"vbscript:",
	"cmd.exe",
	"powershell",
	"/bin/sh",
	"$(",
	"`",
];

/// Words allowed directly before `(` without being treated as a call.
const OPERATOR_KEYWORDS: [&str; 3] = ["and", "or", "not"];

/// Elements that never have a closing tag and so do not add nesting.
const VOID_ELEMENTS: [&str; 14] = [
	"area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
	"track", "wbr",
];

/// Elements whose end tag may be left out when another of the same kind
/// follows.
const SIBLING_CLOSED_ELEMENTS: [&str; 8] = ["p", "li", "dt", "dd", "option", "tr", "td", "th"];

/// Branch markers inside `If` that separate arms rather than open a scope.
const BRANCH_MARKERS: [&str; 2] = ["else", "elseif"];

static SQL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	compile(
		r"(?i)\b(select\s+.+\s+from|insert\s+into|delete\s+from|drop\s+table|update\s+\w+\s+set|union\s+(all\s+)?select)\b",
	)
});
static CALL_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| compile(r"([A-Za-z_][A-Za-z0-9_]*)?\s*\("));
static TYPE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
	compile(
		r"(?i)\b(system|process|file|directory|environment|assembly|activator|appdomain|marshal|registry|console|runtime|reflection)\s*\.",
	)
});
static PROPERTY_PATH_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| compile(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$"));
static STRIP_TAGS_PATTERN: LazyLock<Regex> = LazyLock::new(|| compile(r"<[^>]*>"));
static SCRIPT_TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)<script\b"));
static EVENT_HANDLER_PATTERN: LazyLock<Regex> =
	LazyLock::new(|| compile(r"(?i)<[^>]*\son[a-z]+\s*="));

fn compile(pattern: &str) -> Regex {
	Regex::new(pattern).expect("static pattern must compile")
}

/// Validate an expression before it is resolved.
pub fn validate_expression(expression: &str, config: &SecurityConfig) -> TesseraResult<()> {
	let reject = |reason: String| {
		Err(TesseraError::UnsafeExpression {
			expression: expression.to_string(),
			reason,
		})
	};

	if expression.len() > config.max_expression_length {
		return Err(TesseraError::limit(
			"max_expression_length",
			config.max_expression_length,
			expression.len(),
		));
	}

	if expression.contains('\0') {
		return reject("contains a NUL character".to_string());
	}

	if let Some(fragment) = denied_fragment(expression) {
		return reject(format!("contains the denied fragment `{fragment}`"));
	}

	if let Some(found) = SQL_PATTERN.find(expression) {
		return reject(format!("looks like SQL: `{}`", found.as_str()));
	}

	if let Some(found) = TYPE_NAME_PATTERN.find(expression) {
		return reject(format!("references the type `{}`", found.as_str()));
	}

	let unquoted = blank_quoted(expression);
	for captures in CALL_PATTERN.captures_iter(&unquoted) {
		let name = captures.get(1).map_or("", |name| name.as_str());
		if name.is_empty() {
			continue;
		}
		let allowed = OPERATOR_KEYWORDS
			.iter()
			.any(|keyword| keyword.eq_ignore_ascii_case(name))
			|| config
				.allowed_functions
				.iter()
				.any(|allowed| allowed.eq_ignore_ascii_case(name));
		if !allowed {
			return reject(format!("calls the function `{name}`, which is not allowed"));
		}
	}

	if !config.allow_indexers && unquoted.contains('[') {
		return reject("indexers are disabled".to_string());
	}

	Ok(())
}

/// Validate a conditional expression: every expression rule plus no bare `=`.
pub fn validate_condition(condition: &str, config: &SecurityConfig) -> TesseraResult<()> {
	validate_expression(condition, config).map_err(|error| {
		match error {
			TesseraError::UnsafeExpression { reason, .. } => {
				TesseraError::UnsafeCondition {
					condition: condition.to_string(),
					reason,
				}
			}
			other => other,
		}
	})?;

	let unquoted = blank_quoted(condition);
	let bytes = unquoted.as_bytes();
	for (index, &byte) in bytes.iter().enumerate() {
		if byte != b'=' {
			continue;
		}
		let previous = index.checked_sub(1).map(|previous| bytes[previous]);
		let next = bytes.get(index + 1).copied();
		let is_operator =
			matches!(previous, Some(b'=' | b'!' | b'<' | b'>')) || next == Some(b'=');
		if !is_operator {
			return Err(TesseraError::UnsafeCondition {
				condition: condition.to_string(),
				reason: "contains an assignment `=`".to_string(),
			});
		}
	}

	Ok(())
}

/// Validate a dotted property path such as `User.Address.City`.
pub fn validate_property_path(path: &str, config: &SecurityConfig) -> TesseraResult<()> {
	if !PROPERTY_PATH_PATTERN.is_match(path) {
		return Err(TesseraError::UnsafePropertyPath {
			path: path.to_string(),
			reason: "must be identifiers separated by `.`".to_string(),
		});
	}

	let depth = path.split('.').count();
	if depth > config.max_property_depth {
		return Err(TesseraError::limit(
			"max_property_depth",
			config.max_property_depth,
			depth,
		));
	}

	if let Some(segment) = path.split('.').find(|segment| config.is_blocked(segment)) {
		return Err(TesseraError::UnsafePropertyPath {
			path: path.to_string(),
			reason: format!("`{segment}` is a blocked property name"),
		});
	}

	Ok(())
}

/// Validate a template file path and return it as an absolute path.
///
/// The path must be free of traversal markers, carry an allowed extension and
/// resolve below one of the configured roots. With no roots configured every
/// path is rejected.
pub fn validate_file_path(path: &Path, config: &SecurityConfig) -> TesseraResult<PathBuf> {
	let raw = path.to_string_lossy();
	let reject = |reason: &str| {
		Err(TesseraError::UnsafeFilePath {
			path: raw.to_string(),
			reason: reason.to_string(),
		})
	};

	let lowered = raw.to_lowercase();
	if raw.contains("..") || path.components().any(|part| part == Component::ParentDir) {
		return reject("contains a parent directory reference");
	}
	if raw.contains('~') {
		return reject("contains `~`");
	}
	if ["%2e", "%2f", "%5c"]
		.iter()
		.any(|encoded| lowered.contains(encoded))
	{
		return reject("contains an encoded path separator");
	}
	if raw.contains("//") || raw.contains("\\\\") {
		return reject("contains a doubled separator");
	}

	let extension = path
		.extension()
		.map(|extension| extension.to_string_lossy().to_string())
		.unwrap_or_default();
	if !config
		.allowed_extensions
		.iter()
		.any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&extension))
	{
		return reject("the file extension is not allowed");
	}

	if config.allowed_roots.is_empty() {
		return reject("no allowed roots are configured");
	}

	let resolved = absolutize(path)?;
	for root in &config.allowed_roots {
		if resolved.starts_with(absolutize(root)?) {
			return Ok(resolved);
		}
	}

	reject("resolves outside every allowed root")
}

fn absolutize(path: &Path) -> TesseraResult<PathBuf> {
	let absolute = if path.is_absolute() {
		path.to_path_buf()
	} else {
		std::env::current_dir()?.join(path)
	};

	// Canonicalize the deepest existing ancestor so missing files compare
	// against canonical roots.
	let mut missing = Vec::new();
	let mut current = absolute.as_path();
	loop {
		if let Ok(canonical) = std::fs::canonicalize(current) {
			return Ok(missing
				.iter()
				.rev()
				.fold(canonical, |path: PathBuf, part| path.join(part)));
		}
		let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
			break;
		};
		missing.push(name.to_os_string());
		current = parent;
	}

	Ok(absolute)
}

/// Encode an interpolated value for output.
pub fn encode_output(text: &str, encoding: &OutputEncoding) -> String {
	let mut output = if encoding.strip_tags {
		STRIP_TAGS_PATTERN.replace_all(text, "").into_owned()
	} else {
		text.to_string()
	};

	if encoding.html_encode {
		output = escape_html(&output);
	}

	if encoding.script_encode {
		output = escape_script(&output);
	}

	output
}

/// Escape `& < > " '` as HTML entities.
pub fn escape_html(text: &str) -> String {
	let mut escaped = String::with_capacity(text.len());
	for character in text.chars() {
		match character {
			'&' => escaped.push_str("&amp;"),
			'<' => escaped.push_str("&lt;"),
			'>' => escaped.push_str("&gt;"),
			'"' => escaped.push_str("&quot;"),
			'\'' => escaped.push_str("&#39;"),
			other => escaped.push(other),
		}
	}
	escaped
}

fn escape_script(text: &str) -> String {
	let mut escaped = String::with_capacity(text.len());
	let mut characters = text.chars().peekable();
	while let Some(character) = characters.next() {
		match character {
			'\\' => escaped.push_str("\\\\"),
			'\'' => escaped.push_str("\\'"),
			'"' => escaped.push_str("\\\""),
			'\n' => escaped.push_str("\\n"),
			'\r' => escaped.push_str("\\r"),
			'<' if characters.peek() == Some(&'/') => escaped.push_str("<\\"),
			other => escaped.push(other),
		}
	}
	escaped
}

/// Validate a whole template body before it is scanned.
///
/// Checks run in order: size, interpolation count, nesting depth and finally
/// inline scripts.
pub fn validate_template(source: &str, config: &SecurityConfig) -> TesseraResult<()> {
	let limits = &config.limits;
	if source.len() > limits.max_template_size {
		return Err(TesseraError::limit(
			"max_template_size",
			limits.max_template_size,
			source.len(),
		));
	}

	let interpolations = source.matches("{{").count();
	if interpolations > limits.max_interpolations {
		return Err(TesseraError::limit(
			"max_interpolations",
			limits.max_interpolations,
			interpolations,
		));
	}

	let depth = nesting_depth(source);
	if depth > limits.max_nesting_depth {
		return Err(TesseraError::limit(
			"max_nesting_depth",
			limits.max_nesting_depth,
			depth,
		));
	}

	if !config.allow_inline_scripts {
		for pattern in [&*SCRIPT_TAG_PATTERN, &*EVENT_HANDLER_PATTERN] {
			if let Some(found) = pattern.find(source) {
				return Err(TesseraError::UnsafeTemplate {
					fragment: found.as_str().to_string(),
					reason: "inline scripts are not allowed".to_string(),
				});
			}
		}
	}

	Ok(())
}

/// Deepest tag nesting found by pairing open and close tags by name.
///
/// Tags are delimited the way the scanner delimits them, so a `>` inside a
/// quoted attribute never ends a tag early. A closing tag also closes any
/// unclosed elements opened inside it.
fn nesting_depth(source: &str) -> usize {
	let bytes = source.as_bytes();
	let mut open: Vec<String> = Vec::new();
	let mut deepest = 0;
	let mut cursor = 0;

	while let Some(found) = bytes[cursor..].iter().position(|&byte| byte == b'<') {
		let start = cursor + found;
		cursor = start + 1;

		if bytes[start..].starts_with(b"<!--") {
			cursor = memstr(&bytes[start + 4..], b"-->").map_or(bytes.len(), |close| start + close + 7);
			continue;
		}

		let closing = bytes.get(start + 1) == Some(&b'/');
		let name_start = start + 1 + usize::from(closing);
		let name_length = bytes[name_start..]
			.iter()
			.take_while(|byte| byte.is_ascii_alphanumeric())
			.count();
		if name_length == 0 || !bytes[name_start].is_ascii_alphabetic() {
			continue;
		}

		let name_end = name_start + name_length;
		let Some(tag_end) = find_tag_end(bytes, name_end) else {
			continue;
		};
		cursor = tag_end.close + 1;
		let name = source[name_start..name_end].to_ascii_lowercase();

		if closing {
			if let Some(position) = open.iter().rposition(|tag| *tag == name) {
				open.truncate(position);
			}
			continue;
		}

		if tag_end.self_closing
			|| VOID_ELEMENTS.contains(&name.as_str())
			|| BRANCH_MARKERS.contains(&name.as_str())
		{
			continue;
		}

		if SIBLING_CLOSED_ELEMENTS.contains(&name.as_str()) && open.last() == Some(&name) {
			open.pop();
		}
		open.push(name);
		deepest = deepest.max(open.len());
	}

	deepest
}

fn denied_fragment(expression: &str) -> Option<&'static str> {
	let lowered = expression.to_lowercase();
	DENIED_FRAGMENTS.into_iter().find(|fragment| {
		let starts_with_letter = fragment.starts_with(|c: char| c.is_ascii_alphabetic());
		lowered.match_indices(fragment).any(|(index, _)| {
			!starts_with_letter
				|| lowered[..index]
					.chars()
					.next_back()
					.is_none_or(|previous| !(previous.is_alphanumeric() || previous == '_'))
		})
	})
}

/// Replace the contents of quoted strings with spaces so structural checks
/// ignore literal text.
fn blank_quoted(text: &str) -> String {
	let mut result = String::with_capacity(text.len());
	let mut quote: Option<char> = None;
	for character in text.chars() {
		match quote {
			Some(open) if character == open => {
				quote = None;
				result.push(character);
			}
			Some(_) => result.push(' '),
			None => {
				if character == '"' || character == '\'' {
					quote = Some(character);
				}
				result.push(character);
			}
		}
	}
	result
}
