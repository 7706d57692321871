use crate::ast::Branch;
use crate::ast::ComponentKind;
use crate::ast::ComponentRef;
use crate::ast::Node;
use crate::ast::Parameter;
use crate::ast::Root;
use crate::lexer::scan;
use crate::tokens::Attributes;
use crate::tokens::TagName;
use crate::tokens::Token;
use crate::tokens::TokenKind;

/// Attributes with a fixed meaning on component references. Everything else
/// is forwarded as a parameter.
const COMPONENT_ATTRIBUTES: [&str; 3] = ["component", "name", "oldname"];

/// Slot name used for content outside any named `<Slot>` block.
pub const DEFAULT_SLOT: &str = "default";

/// Deepest tag nesting the parser descends into. Tags below this depth are
/// kept as text.
pub const MAX_PARSE_DEPTH: usize = 256;

/// Build a syntax tree from a token stream.
///
/// Parsing is purely structural: no value is resolved and nothing is
/// validated. Unterminated constructs end at the end of input and stray
/// closing tags are kept as text.
pub fn parse(tokens: &[Token]) -> Root {
	let mut parser = Parser::new(tokens);
	let children = parser.parse_nodes(|_| false);
	Root::new(children)
}

/// Scan and parse template text.
pub fn parse_str(source: &str) -> Root {
	parse(&scan(source))
}

struct Parser<'a> {
	tokens: &'a [Token],
	cursor: usize,
	/// Tags whose bodies are currently being parsed, innermost last.
	open: Vec<TagName>,
	/// Template tags currently being parsed, including self-closing layouts
	/// that adopt their siblings.
	depth: usize,
}

impl<'a> Parser<'a> {
	fn new(tokens: &'a [Token]) -> Self {
		Self {
			tokens,
			cursor: 0,
			open: Vec::new(),
			depth: 0,
		}
	}

	fn peek(&self) -> Option<&'a Token> {
		self.tokens.get(self.cursor)
	}

	fn advance(&mut self) -> Option<&'a Token> {
		let token = self.tokens.get(self.cursor)?;
		self.cursor += 1;
		Some(token)
	}

	/// A closing tag that belongs to a construct further up the stack ends
	/// the current child list without being consumed.
	fn closes_enclosing(&self, token: &Token) -> bool {
		match token.kind {
			TokenKind::CloseTag(tag) => self.open.contains(&tag),
			_ => false,
		}
	}

	/// Parse sibling nodes until `stop` matches, an enclosing tag closes or
	/// input ends.
	fn parse_nodes(&mut self, stop: impl Fn(&Token) -> bool) -> Vec<Node> {
		let mut nodes = Vec::new();
		while let Some(token) = self.peek() {
			if stop(token) || self.closes_enclosing(token) {
				break;
			}

			if let Some(node) = self.parse_node() {
				push_node(&mut nodes, node);
			}
		}
		nodes
	}

	/// Parse the body of `tag` up to and including its closing tag.
	fn parse_block(&mut self, tag: TagName) -> Vec<Node> {
		self.open.push(tag);
		let children = self.parse_nodes(|_| false);
		self.open.pop();

		if self.peek().is_some_and(|token| token.is_close(tag)) {
			self.cursor += 1;
		}

		children
	}

	fn parse_node(&mut self) -> Option<Node> {
		let token = self.advance()?;
		match token.kind {
			TokenKind::Text => Some(Node::Text(token.value.clone())),
			TokenKind::Interpolation => Some(Node::Interpolation(token.value.clone())),
			// Closing tags of enclosing constructs never reach this point.
			TokenKind::CloseTag(_) => Some(Node::Text(token.value.clone())),
			TokenKind::OpenTag(_) | TokenKind::SelfClosingTag(_) if self.depth >= MAX_PARSE_DEPTH => {
				Some(Node::Text(token.value.clone()))
			}
			TokenKind::OpenTag(tag) => self.parse_nested(tag, token, false),
			TokenKind::SelfClosingTag(tag) => self.parse_nested(tag, token, true),
		}
	}

	fn parse_nested(&mut self, tag: TagName, token: &'a Token, self_closing: bool) -> Option<Node> {
		self.depth += 1;
		let node = self.parse_tag(tag, token, self_closing);
		self.depth -= 1;
		node
	}

	fn parse_tag(&mut self, tag: TagName, token: &'a Token, self_closing: bool) -> Option<Node> {
		let node = match tag {
			TagName::Element | TagName::Data | TagName::Nav | TagName::Block => {
				if token.attribute("component").is_some() {
					Node::Component(self.parse_component(
						ComponentKind::Container(tag),
						token,
						self_closing,
					))
				} else {
					let children = self.parse_body(tag, self_closing);
					Node::Container {
						tag,
						attributes: token.attributes(),
						children,
					}
				}
			}
			TagName::Include => {
				Node::Component(self.parse_component(ComponentKind::Include, token, self_closing))
			}
			TagName::If => self.parse_conditional(token, self_closing),
			// Branch markers outside an `If` body have no meaning.
			TagName::ElseIf | TagName::Else => Node::Text(token.value.clone()),
			TagName::ForEach => {
				let (variable, collection) = token
					.meta
					.as_ref()
					.and_then(|meta| meta.loop_spec.as_deref())
					.and_then(|spec| spec.split_once('|'))
					.map(|(variable, collection)| (variable.trim(), collection.trim()))
					.unwrap_or_default();
				Node::Loop {
					variable: variable.to_string(),
					collection: collection.to_string(),
					children: self.parse_body(tag, self_closing),
				}
			}
			TagName::Param => {
				// A parameter outside a component stream is dropped.
				self.parse_body(tag, self_closing);
				return None;
			}
			TagName::Slot => {
				Node::Slot {
					name: slot_name(token),
					default: self.parse_body(tag, self_closing),
				}
			}
			TagName::Layout => {
				let children = if self_closing {
					// A self-closing layout adopts the rest of its siblings.
					self.parse_nodes(|_| false)
				} else {
					self.parse_block(tag)
				};
				Node::Layout {
					name: name_attribute(token),
					children,
				}
			}
			TagName::Section => {
				Node::Section {
					name: name_attribute(token),
					children: self.parse_body(tag, self_closing),
				}
			}
			TagName::RenderSection => {
				Node::RenderSection {
					name: name_attribute(token),
					required: token
						.attribute("required")
						.is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
					default: self.parse_body(tag, self_closing),
				}
			}
			TagName::RenderBody => {
				self.parse_body(tag, self_closing);
				Node::RenderBody
			}
			TagName::Define => {
				Node::FragmentDefine {
					name: name_attribute(token),
					body: self.parse_body(tag, self_closing),
				}
			}
			TagName::Render => self.parse_fragment_invoke(token, self_closing),
		};

		Some(node)
	}

	fn parse_body(&mut self, tag: TagName, self_closing: bool) -> Vec<Node> {
		if self_closing {
			Vec::new()
		} else {
			self.parse_block(tag)
		}
	}

	/// `If`, any number of `ElseIf` arms and an optional `Else`, ending at
	/// `</If>`. Closing `</ElseIf>` and `</Else>` tags are tolerated and
	/// ignored.
	fn parse_conditional(&mut self, token: &Token, self_closing: bool) -> Node {
		let mut branches = Vec::new();
		let mut otherwise: Option<Vec<Node>> = None;
		let mut condition = condition_of(token);

		if self_closing {
			branches.push(Branch {
				condition,
				children: Vec::new(),
			});
			return Node::Conditional {
				branches,
				otherwise,
			};
		}

		self.open.push(TagName::If);
		let mut in_else = false;
		let mut children = Vec::new();

		loop {
			for node in self.parse_nodes(is_branch_boundary) {
				push_node(&mut children, node);
			}

			let next = self.peek();
			let finished = match next.map(|token| token.kind) {
				Some(TokenKind::CloseTag(TagName::ElseIf | TagName::Else)) => {
					self.cursor += 1;
					continue;
				}
				Some(TokenKind::OpenTag(TagName::ElseIf) | TokenKind::SelfClosingTag(TagName::ElseIf)) => {
					self.cursor += 1;
					false
				}
				Some(TokenKind::OpenTag(TagName::Else) | TokenKind::SelfClosingTag(TagName::Else)) => {
					self.cursor += 1;
					false
				}
				Some(TokenKind::CloseTag(TagName::If)) => {
					self.cursor += 1;
					true
				}
				_ => true,
			};

			let body = std::mem::take(&mut children);
			if in_else {
				otherwise.get_or_insert_with(Vec::new).extend(body);
			} else {
				branches.push(Branch {
					condition: std::mem::take(&mut condition),
					children: body,
				});
			}

			if finished {
				break;
			}

			// `next` is the branch marker just consumed.
			if let Some(marker) = next {
				if marker.is_open(TagName::Else) {
					in_else = true;
				} else {
					in_else = false;
					condition = condition_of(marker);
				}
			}
		}

		self.open.pop();
		Node::Conditional {
			branches,
			otherwise,
		}
	}

	/// The mixed child stream of a component reference: `Param` tokens,
	/// named `Slot` blocks and default slot content.
	fn parse_component(
		&mut self,
		kind: ComponentKind,
		token: &Token,
		self_closing: bool,
	) -> ComponentRef {
		let tag = match kind {
			ComponentKind::Include => TagName::Include,
			ComponentKind::Container(tag) => tag,
		};

		let mut parameters = Vec::new();
		let mut default_slot = Vec::new();
		let mut slots: Vec<(String, Vec<Node>)> = Vec::new();

		if !self_closing {
			self.open.push(tag);
			while let Some(next) = self.peek() {
				if next.is_close(tag) {
					self.cursor += 1;
					break;
				}
				if self.closes_enclosing(next) {
					break;
				}

				match next.kind {
					TokenKind::OpenTag(TagName::Param) | TokenKind::SelfClosingTag(TagName::Param) => {
						self.cursor += 1;
						if let Some(parameter) = parameter_of(next) {
							parameters.push(parameter);
						}
						if matches!(next.kind, TokenKind::OpenTag(_)) {
							self.parse_block(TagName::Param);
						}
					}
					TokenKind::CloseTag(TagName::Param) => self.cursor += 1,
					TokenKind::OpenTag(TagName::Slot) | TokenKind::SelfClosingTag(TagName::Slot) => {
						self.cursor += 1;
						let name = slot_name(next);
						let self_closing = matches!(next.kind, TokenKind::SelfClosingTag(_));
						let body = self.parse_body(TagName::Slot, self_closing);
						if name.eq_ignore_ascii_case(DEFAULT_SLOT) {
							for node in body {
								push_node(&mut default_slot, node);
							}
						} else if let Some((_, existing)) =
							slots.iter_mut().find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
						{
							existing.extend(body);
						} else {
							slots.push((name, body));
						}
					}
					_ => {
						if let Some(node) = self.parse_node() {
							push_node(&mut default_slot, node);
						}
					}
				}
			}
			self.open.pop();
		}

		let attributes = token.attributes();
		parameters.extend(extra_parameters(&attributes, &COMPONENT_ATTRIBUTES));

		ComponentRef {
			kind,
			component: attributes
				.get("component")
				.unwrap_or_default()
				.trim()
				.to_string(),
			name: non_empty(attributes.get("name")),
			old_name: non_empty(attributes.get("oldname")),
			parameters,
			default_slot,
			slots,
		}
	}

	/// `<Render name="f" a="1"/>`. The open form may also carry `Param`
	/// children; any other content is ignored.
	fn parse_fragment_invoke(&mut self, token: &Token, self_closing: bool) -> Node {
		let mut parameters = extra_parameters(&token.attributes(), &["name"]);

		if !self_closing {
			self.open.push(TagName::Render);
			while let Some(next) = self.peek() {
				if next.is_close(TagName::Render) {
					self.cursor += 1;
					break;
				}
				if self.closes_enclosing(next) {
					break;
				}

				if next.is_open(TagName::Param) {
					self.cursor += 1;
					if let Some(parameter) = parameter_of(next) {
						parameters.push(parameter);
					}
					if matches!(next.kind, TokenKind::OpenTag(_)) {
						self.parse_block(TagName::Param);
					}
				} else {
					self.parse_node();
				}
			}
			self.open.pop();
		}

		Node::FragmentInvoke {
			name: name_attribute(token),
			parameters,
		}
	}
}

fn is_branch_boundary(token: &Token) -> bool {
	matches!(
		token.kind,
		TokenKind::OpenTag(TagName::ElseIf | TagName::Else)
			| TokenKind::SelfClosingTag(TagName::ElseIf | TagName::Else)
			| TokenKind::CloseTag(TagName::If | TagName::ElseIf | TagName::Else)
	)
}

/// Append a node, merging adjacent text.
fn push_node(nodes: &mut Vec<Node>, node: Node) {
	if let Node::Text(text) = &node {
		if let Some(Node::Text(previous)) = nodes.last_mut() {
			previous.push_str(text);
			return;
		}
	}
	nodes.push(node);
}

fn condition_of(token: &Token) -> String {
	token
		.meta
		.as_ref()
		.and_then(|meta| meta.condition.clone())
		.unwrap_or_default()
}

fn name_attribute(token: &Token) -> String {
	token.attribute("name").unwrap_or_default().trim().to_string()
}

fn slot_name(token: &Token) -> String {
	match token.attribute("name").map(str::trim) {
		Some(name) if !name.is_empty() => name.to_string(),
		_ => DEFAULT_SLOT.to_string(),
	}
}

fn non_empty(value: Option<&str>) -> Option<String> {
	value
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_string)
}

fn parameter_of(token: &Token) -> Option<Parameter> {
	let name = non_empty(token.attribute("name"))?;
	Some(Parameter {
		name,
		value: token.attribute("value").unwrap_or_default().to_string(),
		default: token.attribute("default").map(str::to_string),
	})
}

fn extra_parameters(attributes: &Attributes, reserved: &[&str]) -> Vec<Parameter> {
	attributes
		.iter()
		.filter(|attribute| {
			!reserved
				.iter()
				.any(|name| attribute.name.eq_ignore_ascii_case(name))
		})
		.map(|attribute| {
			Parameter {
				name: attribute.name.clone(),
				value: attribute.value.clone(),
				default: None,
			}
		})
		.collect()
}
