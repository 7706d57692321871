use std::cell::Cell;
use std::collections::HashMap;

use tracing::trace;
use tracing::warn;

use crate::TesseraError;
use crate::TesseraResult;
use crate::Value;
use crate::Variables;
use crate::ast::Node;
use crate::ast::Parameter;
use crate::ast::Root;
use crate::ast::walk;
use crate::component::ComponentHooks;
use crate::component::ComponentLoader;
use crate::config::SecurityConfig;
use crate::expression;
use crate::expression::Bindings;
use crate::filters::FilterRegistry;
use crate::filters::parse_filter;
use crate::filters::split_pipes;
use crate::lexer::memstr;
use crate::resolver::resolve_index;
use crate::resolver::resolve_member;
use crate::resolver::resolve_path;
use crate::security::encode_output;
use crate::security::escape_html;
use crate::security::validate_condition;
use crate::security::validate_expression;
use crate::security::validate_property_path;
use crate::variables::SharedVariables;

/// Loop and recursion counters shared by every evaluator of one render.
#[derive(Debug, Default)]
pub(crate) struct Budget {
	loop_iterations: Cell<usize>,
	recursion_depth: Cell<usize>,
}

impl Budget {
	pub fn loop_scope(&self, limit: usize) -> BudgetScope<'_> {
		BudgetScope::new(&self.loop_iterations, limit, "max_loop_iterations")
	}

	pub fn recursion_scope(&self, limit: usize) -> BudgetScope<'_> {
		BudgetScope::new(&self.recursion_depth, limit, "max_recursion_depth")
	}

	pub fn loop_iterations(&self) -> usize {
		self.loop_iterations.get()
	}

	pub fn recursion_depth(&self) -> usize {
		self.recursion_depth.get()
	}
}

/// Charges one counter of a [`Budget`]. Dropping the scope restores the
/// counter to its value when the scope was opened, on success and on failure
/// alike.
pub(crate) struct BudgetScope<'b> {
	counter: &'b Cell<usize>,
	start: usize,
	limit: usize,
	name: &'static str,
}

impl<'b> BudgetScope<'b> {
	fn new(counter: &'b Cell<usize>, limit: usize, name: &'static str) -> Self {
		Self {
			counter,
			start: counter.get(),
			limit,
			name,
		}
	}

	pub fn charge(&self) -> TesseraResult<()> {
		let next = self.counter.get() + 1;
		if next > self.limit {
			return Err(TesseraError::limit(self.name, self.limit, next));
		}
		self.counter.set(next);
		Ok(())
	}
}

impl Drop for BudgetScope<'_> {
	fn drop(&mut self) {
		self.counter.set(self.start);
	}
}

/// Everything an evaluator borrows from the engine for one render.
#[derive(Clone, Copy)]
pub(crate) struct RenderContext<'a> {
	pub security: &'a SecurityConfig,
	pub filters: &'a FilterRegistry,
	pub loader: Option<&'a dyn ComponentLoader>,
	pub hooks: &'a ComponentHooks,
	/// The caller-owned store that include callbacks mutate.
	pub store: Option<&'a SharedVariables>,
	pub budget: &'a Budget,
}

/// Render `root` with `env` as its variable environment.
pub(crate) fn render_tree(ctx: RenderContext<'_>, root: &Root, env: Variables) -> TesseraResult<String> {
	let mut evaluator = Evaluator::new(ctx, env, 0);
	evaluator.render_root(root)?;
	Ok(evaluator.finish())
}

/// Walks one syntax tree, writing to its own output buffer.
pub(crate) struct Evaluator<'a> {
	pub(crate) ctx: RenderContext<'a>,
	pub(crate) env: Variables,
	out: String,
	/// Fragment bodies by lowercased name, collected before rendering.
	fragments: HashMap<String, &'a [Node]>,
	/// Section content handed to a layout.
	layout_sections: HashMap<String, String>,
	/// Non-section content handed to a layout.
	layout_body: Option<String>,
	/// Set while the children of a `<Layout>` are rendered.
	collected_sections: Option<HashMap<String, String>>,
	/// Pre-rendered slot content handed to a component.
	pub(crate) slots: HashMap<String, String>,
	pub(crate) include_depth: usize,
}

impl<'a> Evaluator<'a> {
	pub(crate) fn new(ctx: RenderContext<'a>, env: Variables, include_depth: usize) -> Self {
		Self {
			ctx,
			env,
			out: String::new(),
			fragments: HashMap::new(),
			layout_sections: HashMap::new(),
			layout_body: None,
			collected_sections: None,
			slots: HashMap::new(),
			include_depth,
		}
	}

	pub(crate) fn finish(self) -> String {
		self.out
	}

	pub(crate) fn push_output(&mut self, text: &str) {
		self.out.push_str(text);
	}

	pub(crate) fn render_root(&mut self, root: &'a Root) -> TesseraResult<()> {
		self.hoist_fragments(&root.children);
		self.render_nodes(&root.children)
	}

	/// Register every `<Define>` in the tree so forward and recursive
	/// references work. The first definition of a name wins.
	fn hoist_fragments(&mut self, nodes: &'a [Node]) {
		walk(nodes, &mut |node| {
			if let Node::FragmentDefine { name, body } = node {
				self.fragments
					.entry(name.to_lowercase())
					.or_insert(body.as_slice());
			}
		});
	}

	pub(crate) fn render_nodes(&mut self, nodes: &'a [Node]) -> TesseraResult<()> {
		for node in nodes {
			self.render_node(node)?;
		}
		Ok(())
	}

	/// Render `nodes` into a separate buffer and return it.
	pub(crate) fn capture(&mut self, nodes: &'a [Node]) -> TesseraResult<String> {
		let saved = std::mem::take(&mut self.out);
		let result = self.render_nodes(nodes);
		let captured = std::mem::replace(&mut self.out, saved);
		result.map(|()| captured)
	}

	fn render_node(&mut self, node: &'a Node) -> TesseraResult<()> {
		match node {
			Node::Text(text) => self.out.push_str(text),
			Node::Interpolation(expression) => {
				if let Some(value) = self.resolve(expression)? {
					let encoded = encode_output(&value.to_string(), &self.ctx.security.encoding);
					self.out.push_str(&encoded);
				}
			}
			Node::Container { children, .. } => self.render_nodes(children)?,
			Node::Conditional {
				branches,
				otherwise,
			} => {
				for branch in branches {
					validate_condition(branch.condition.trim(), self.ctx.security)?;
					let truthy = self
						.resolve(&branch.condition)?
						.is_some_and(|value| value.is_truthy());
					trace!(condition = %branch.condition, truthy, "evaluated branch");
					if truthy {
						return self.render_nodes(&branch.children);
					}
				}
				if let Some(otherwise) = otherwise {
					self.render_nodes(otherwise)?;
				}
			}
			Node::Loop {
				variable,
				collection,
				children,
			} => self.render_loop(variable, collection, children)?,
			Node::Component(component) => self.render_component(component)?,
			Node::Layout { name, children } => self.render_layout(name, children)?,
			Node::Section { name, children } => {
				if self.collected_sections.is_some() {
					let content = self.capture(children)?;
					if let Some(sections) = self.collected_sections.as_mut() {
						sections.entry(name.to_lowercase()).or_insert(content);
					}
				} else {
					self.render_nodes(children)?;
				}
			}
			Node::RenderSection {
				name,
				required,
				default,
			} => {
				if let Some(content) = self.layout_sections.get(&name.to_lowercase()) {
					self.out.push_str(content);
				} else if *required {
					self.diagnostic(&format!("missing required section `{name}`"));
				} else {
					self.render_nodes(default)?;
				}
			}
			Node::RenderBody => {
				if let Some(body) = &self.layout_body {
					self.out.push_str(body);
				}
			}
			Node::Slot { name, default } => {
				if let Some(content) = self.slots.get(&name.to_lowercase()) {
					self.out.push_str(content);
				} else {
					self.render_nodes(default)?;
				}
			}
			Node::FragmentDefine { .. } => {}
			Node::FragmentInvoke { name, parameters } => self.render_fragment(name, parameters)?,
		}

		Ok(())
	}

	fn render_loop(
		&mut self,
		variable: &str,
		collection: &str,
		children: &'a [Node],
	) -> TesseraResult<()> {
		let Some(value) = self.resolve(collection)? else {
			return Ok(());
		};
		let Some(items) = value.try_iter() else {
			trace!(collection, "loop collection is not enumerable");
			return Ok(());
		};

		let budget = self.ctx.budget;
		let scope = budget.loop_scope(self.ctx.security.limits.max_loop_iterations);
		let previous = self.env.get(variable).cloned();

		let mut result = Ok(());
		for item in items {
			if let Err(error) = scope.charge() {
				result = Err(error);
				break;
			}
			self.env.insert(variable, item);
			if let Err(error) = self.render_nodes(children) {
				result = Err(error);
				break;
			}
		}

		match previous {
			Some(previous) => {
				self.env.insert(variable, previous);
			}
			None => {
				self.env.remove(variable);
			}
		}

		result
	}

	fn render_fragment(&mut self, name: &str, parameters: &[Parameter]) -> TesseraResult<()> {
		let Some(body) = self.fragments.get(&name.to_lowercase()).copied() else {
			self.diagnostic(&format!("fragment `{name}` is not defined"));
			return Ok(());
		};

		let budget = self.ctx.budget;
		let scope = budget.recursion_scope(self.ctx.security.limits.max_recursion_depth);
		scope.charge()?;

		let mut bindings = Vec::with_capacity(parameters.len());
		for parameter in parameters {
			bindings.push((parameter.name.clone(), self.resolve_parameter(parameter)?));
		}

		let saved = self.env.clone();
		for (name, value) in bindings {
			self.env.insert(name, value);
		}
		let result = self.render_nodes(body);
		self.env = saved;

		result
	}

	fn render_layout(&mut self, name: &str, children: &'a [Node]) -> TesseraResult<()> {
		let name = self.interpolate(name)?;

		let outer = self.collected_sections.replace(HashMap::new());
		let body = self.capture(children);
		let sections = std::mem::replace(&mut self.collected_sections, outer).unwrap_or_default();
		let body = body?;

		let tree = match self.ctx.loader {
			Some(loader) if !name.is_empty() => loader.load(&name)?,
			_ => None,
		};

		let Some(tree) = tree else {
			trace!(layout = %name, "layout not found, rendering body only");
			self.out.push_str(&body);
			return Ok(());
		};

		// Layouts share the include depth so a layout that wraps itself stops.
		let max_depth = self.ctx.security.limits.max_include_depth;
		if self.include_depth >= max_depth {
			self.diagnostic(&format!(
				"layout `{name}` exceeds the maximum include depth of {max_depth}"
			));
			self.out.push_str(&body);
			return Ok(());
		}

		let mut layout = Evaluator::new(self.ctx, self.env.clone(), self.include_depth + 1);
		layout.layout_sections = sections;
		layout.layout_body = Some(body);
		layout.render_root(&tree)?;
		self.out.push_str(&layout.finish());

		Ok(())
	}

	/// Emit an HTML comment describing a recoverable problem.
	pub(crate) fn diagnostic(&mut self, message: &str) {
		warn!("{message}");
		self.out.push_str("<!-- tessera: ");
		self.out.push_str(&escape_html(message));
		self.out.push_str(" -->");
	}

	/// Resolve an expression to a value.
	///
	/// The expression is validated first; a violation is returned as an
	/// error. Unknown names, null intermediates and blocked members resolve
	/// to `None`.
	pub(crate) fn resolve(&self, expression: &str) -> TesseraResult<Option<Value>> {
		let expression = expression.trim();
		if expression.is_empty() {
			return Ok(None);
		}

		validate_expression(expression, self.ctx.security)?;
		let value = self.resolve_validated(expression, true)?;
		Ok(value.map(Value::unwrap_quoted).filter(|value| !value.is_null()))
	}

	fn resolve_validated(&self, expression: &str, delegate: bool) -> TesseraResult<Option<Value>> {
		let expression = expression.trim();

		if let Some(resolved) = self.resolve_indexed(expression)? {
			return Ok(resolved);
		}

		if let Some(value) = self.direct(expression) {
			return Ok(Some(value));
		}

		let segments = split_pipes(expression);
		if segments.len() > 1 {
			return self.resolve_pipe(&segments);
		}

		if expression.contains('.') && is_path_like(expression) {
			return self.resolve_dotted(expression);
		}

		if is_identifier(expression) || !delegate {
			return Ok(None);
		}

		expression::evaluate(expression, self)
	}

	/// A whole expression bound as a variable name, which may contain dots.
	fn direct(&self, expression: &str) -> Option<Value> {
		if self.ctx.security.is_blocked(expression) {
			return None;
		}
		self.env.get(expression).cloned()
	}

	/// `target[index]` followed by nothing or further member and indexer
	/// accesses. Returns `Ok(None)` when the expression does not have that
	/// shape.
	fn resolve_indexed(&self, expression: &str) -> TesseraResult<Option<Option<Value>>> {
		let Some(open) = find_unquoted(expression, b'[') else {
			return Ok(None);
		};
		let Some(close) = matching_bracket(expression, open) else {
			return Ok(None);
		};

		let target = expression[..open].trim();
		let remainder = expression[close + 1..].trim_start();
		if target.is_empty() || !(remainder.is_empty() || remainder.starts_with(['.', '['])) {
			return Ok(None);
		}

		let Some(root) = self.resolve_validated(target, false)? else {
			return Ok(Some(None));
		};
		let index = self.resolve_index_key(&expression[open + 1..close])?;
		let Some(value) = resolve_index(&root, &index) else {
			return Ok(Some(None));
		};

		self.walk_accessors(value, remainder).map(Some)
	}

	/// Apply a chain of `.member` and `[index]` accessors.
	fn walk_accessors(&self, mut value: Value, mut rest: &str) -> TesseraResult<Option<Value>> {
		while !rest.is_empty() {
			if value.is_null() {
				return Ok(None);
			}

			if let Some(member_text) = rest.strip_prefix('.') {
				let end = member_text.find(['.', '[']).unwrap_or(member_text.len());
				let member = member_text[..end].trim();
				if self.ctx.security.is_blocked(member) {
					return Ok(None);
				}
				let Some(next) = resolve_member(&value, member) else {
					return Ok(None);
				};
				value = next;
				rest = &member_text[end..];
			} else if rest.starts_with('[') {
				let Some(close) = matching_bracket(rest, 0) else {
					return Ok(None);
				};
				let index = self.resolve_index_key(&rest[1..close])?;
				let Some(next) = resolve_index(&value, &index) else {
					return Ok(None);
				};
				value = next;
				rest = rest[close + 1..].trim_start();
			} else {
				return Ok(None);
			}
		}

		Ok(if value.is_null() { None } else { Some(value) })
	}

	/// Quoted text and integers are literal keys. Anything else is resolved
	/// as an expression, falling back to the text itself.
	fn resolve_index_key(&self, text: &str) -> TesseraResult<Value> {
		let text = text.trim();
		if let Some(literal) = literal_value(text) {
			return Ok(literal);
		}
		Ok(self
			.resolve_validated(text, true)?
			.unwrap_or_else(|| Value::from(text)))
	}

	fn resolve_pipe(&self, segments: &[&str]) -> TesseraResult<Option<Value>> {
		let Some((first, filters)) = segments.split_first() else {
			return Ok(None);
		};

		let mut value = self
			.resolve_validated(first, true)?
			.map(Value::unwrap_quoted)
			.unwrap_or_default();
		for segment in filters {
			let (name, raw_arguments) = parse_filter(segment);
			if name.is_empty() {
				continue;
			}
			let mut arguments = Vec::with_capacity(raw_arguments.len());
			for raw in raw_arguments {
				arguments.push(self.resolve_index_key(raw)?.unwrap_quoted());
			}
			value = self.ctx.filters.invoke(name, &value, &arguments);
		}

		Ok(if value.is_null() { None } else { Some(value) })
	}

	/// Resolve `a.b.c` by trying the longest bound prefix first, so a
	/// variable literally named `a.b` wins over member `b` of `a`.
	fn resolve_dotted(&self, expression: &str) -> TesseraResult<Option<Value>> {
		let segments: Vec<&str> = expression.split('.').map(str::trim).collect();
		if segments
			.iter()
			.any(|segment| self.ctx.security.is_blocked(segment))
		{
			return Ok(None);
		}

		validate_property_path(&segments.join("."), self.ctx.security)?;

		for length in (1..=segments.len()).rev() {
			let key = segments[..length].join(".");
			if let Some(root) = self.env.get(&key) {
				return Ok(resolve_path(root, &segments[length..], self.ctx.security));
			}
		}

		Ok(None)
	}

	/// Resolve a component or fragment parameter.
	///
	/// Empty values are null. A value that is exactly `{{name}}` resolves
	/// `name`; other values containing `{{` are interpolated. Values without
	/// spaces or quotes are tried as expressions and fall back to the literal
	/// text; anything else is literal. A null or empty result is replaced by
	/// the default.
	pub(crate) fn resolve_parameter(&self, parameter: &Parameter) -> TesseraResult<Value> {
		let raw = parameter.value.trim();
		let mut value = if raw.is_empty() {
			Value::Null
		} else if let Some(inner) = exact_interpolation(raw) {
			self.resolve(inner)?.unwrap_or_default()
		} else if raw.contains("{{") {
			Value::from(self.interpolate(raw)?)
		} else if !raw.contains([' ', '"', '\'']) {
			self.resolve(raw)?.unwrap_or_else(|| Value::from(raw))
		} else {
			Value::from(parameter.value.as_str())
		};

		if value.is_empty_text() {
			if let Some(default) = &parameter.default {
				value = if default.contains("{{") {
					Value::from(self.interpolate(default)?)
				} else {
					Value::from(default.as_str())
				};
			}
		}

		Ok(value)
	}

	/// Replace every `{{ expr }}` in `text` with its resolved value, without
	/// output encoding. Unterminated spans stay literal.
	pub(crate) fn interpolate(&self, text: &str) -> TesseraResult<String> {
		let mut result = String::with_capacity(text.len());
		let mut rest = text;

		while let Some(open) = memstr(rest.as_bytes(), b"{{") {
			let after_open = &rest[open + 2..];
			let Some(close) = memstr(after_open.as_bytes(), b"}}") else {
				break;
			};
			result.push_str(&rest[..open]);
			if let Some(value) = self.resolve(&after_open[..close])? {
				result.push_str(&value.to_string());
			}
			rest = &after_open[close + 2..];
		}

		result.push_str(rest);
		Ok(result)
	}
}

impl Bindings for Evaluator<'_> {
	fn lookup(&self, reference: &str) -> TesseraResult<Option<Value>> {
		self.resolve_validated(reference, false)
	}
}

/// `{{name}}` with nothing around it.
fn exact_interpolation(text: &str) -> Option<&str> {
	let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
	if inner.contains("{{") || inner.contains("}}") {
		return None;
	}
	Some(inner.trim())
}

fn literal_value(text: &str) -> Option<Value> {
	let bytes = text.as_bytes();
	if bytes.len() >= 2 && matches!(bytes[0], b'"' | b'\'') && bytes[bytes.len() - 1] == bytes[0] {
		return Some(Value::from(&text[1..text.len() - 1]));
	}
	text.parse::<i64>().ok().map(Value::Int)
}

fn is_identifier(text: &str) -> bool {
	let mut characters = text.chars();
	characters
		.next()
		.is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
		&& characters.all(|character| character.is_ascii_alphanumeric() || character == '_')
}

/// Identifiers joined by dots, allowing spaces around the dots.
fn is_path_like(text: &str) -> bool {
	text.split('.').all(|segment| is_identifier(segment.trim()))
}

fn find_unquoted(text: &str, needle: u8) -> Option<usize> {
	let mut quote: Option<u8> = None;
	for (index, &byte) in text.as_bytes().iter().enumerate() {
		match quote {
			Some(open) if byte == open => quote = None,
			Some(_) => {}
			None if byte == b'"' || byte == b'\'' => quote = Some(byte),
			None if byte == needle => return Some(index),
			None => {}
		}
	}
	None
}

/// Offset of the `]` matching the `[` at `open`, honoring nesting and quotes.
fn matching_bracket(text: &str, open: usize) -> Option<usize> {
	let mut depth = 0_usize;
	let mut quote: Option<u8> = None;
	for (index, &byte) in text.as_bytes().iter().enumerate().skip(open) {
		match quote {
			Some(current) if byte == current => quote = None,
			Some(_) => {}
			None => {
				match byte {
					b'"' | b'\'' => quote = Some(byte),
					b'[' => depth += 1,
					b']' => {
						depth -= 1;
						if depth == 0 {
							return Some(index);
						}
					}
					_ => {}
				}
			}
		}
	}
	None
}
