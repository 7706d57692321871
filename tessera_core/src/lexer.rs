use logos::Lexer;
use logos::Logos;
use snailquote::unescape;

use crate::tokens::Attributes;
use crate::tokens::TagMeta;
use crate::tokens::TagName;
use crate::tokens::Token;
use crate::tokens::TokenKind;

/// Raw tokens produced by logos. Only the points where template syntax can
/// start are distinguished; everything else is text.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum RawToken {
	#[token("{{")]
	InterpolationOpen,
	#[token("<!--")]
	CommentOpen,
	#[regex(r"</?[A-Za-z][A-Za-z0-9]*")]
	TagStart,
	#[regex(r"[^{<]+")]
	Text,
	#[token("{")]
	Brace,
	#[token("<")]
	Angle,
}

/// Tracks the 1-indexed line of byte offsets that only ever move forward.
struct LineTracker<'a> {
	source: &'a str,
	offset: usize,
	line: usize,
}

impl<'a> LineTracker<'a> {
	fn new(source: &'a str) -> Self {
		Self {
			source,
			offset: 0,
			line: 1,
		}
	}

	fn line_at(&mut self, offset: usize) -> usize {
		if offset > self.offset {
			self.line += count_byte(&self.source.as_bytes()[self.offset..offset], b'\n');
			self.offset = offset;
		}
		self.line
	}
}

/// Walks the logos token stream, recognizing interpolations, comments and
/// template tags and merging everything else into text tokens.
struct Scanner<'a> {
	source: &'a str,
	lexer: Lexer<'a, RawToken>,
	lines: LineTracker<'a>,
	/// Byte range of the text run not yet emitted.
	pending_text: Option<(usize, usize)>,
	tokens: Vec<Token>,
}

impl<'a> Scanner<'a> {
	fn new(source: &'a str) -> Self {
		Self {
			source,
			lexer: RawToken::lexer(source),
			lines: LineTracker::new(source),
			pending_text: None,
			tokens: Vec::new(),
		}
	}

	fn process(mut self) -> Vec<Token> {
		while let Some(raw) = self.lexer.next() {
			let span = self.lexer.span();
			match raw {
				Ok(RawToken::InterpolationOpen) => self.process_interpolation(span.start, span.end),
				Ok(RawToken::CommentOpen) => self.process_comment(span.start, span.end),
				Ok(RawToken::TagStart) => self.process_tag(span.start, span.end),
				Ok(RawToken::Text | RawToken::Brace | RawToken::Angle) | Err(()) => {
					self.push_text(span.start, span.end);
				}
			}
		}

		self.flush_text();
		self.tokens
	}

	/// Consume source up to `end`, extending the current logos token.
	fn consume_until(&mut self, end: usize) {
		let current_end = self.lexer.span().end;
		if end > current_end {
			self.lexer.bump(end - current_end);
		}
	}

	fn push_text(&mut self, start: usize, end: usize) {
		self.pending_text = match self.pending_text {
			Some((text_start, _)) => Some((text_start, end)),
			None => Some((start, end)),
		};
	}

	fn flush_text(&mut self) {
		if let Some((start, end)) = self.pending_text.take() {
			let line = self.lines.line_at(start);
			self.tokens.push(Token {
				kind: TokenKind::Text,
				value: self.source[start..end].to_string(),
				offset: start,
				line,
				meta: None,
			});
		}
	}

	fn push_token(&mut self, kind: TokenKind, value: String, offset: usize, meta: Option<TagMeta>) {
		self.flush_text();
		let line = self.lines.line_at(offset);
		self.tokens.push(Token {
			kind,
			value,
			offset,
			line,
			meta,
		});
	}

	/// `{{ expr }}`. An unterminated span stays literal text.
	fn process_interpolation(&mut self, start: usize, open_end: usize) {
		let Some(close) = memstr(&self.source.as_bytes()[open_end..], b"}}") else {
			self.push_text(start, open_end);
			return;
		};

		let close = open_end + close;
		let expression = self.source[open_end..close].trim().to_string();
		self.push_token(TokenKind::Interpolation, expression, start, None);
		self.consume_until(close + 2);
	}

	/// HTML comments are re-emitted verbatim without looking inside them.
	fn process_comment(&mut self, start: usize, open_end: usize) {
		let end = memstr(&self.source.as_bytes()[open_end..], b"-->")
			.map_or(self.source.len(), |close| open_end + close + 3);
		self.push_text(start, end);
		self.consume_until(end);
	}

	fn process_tag(&mut self, start: usize, name_end: usize) {
		let source = self.source;
		let slice = &source[start..name_end];
		let (is_close, name) = match slice.strip_prefix("</") {
			Some(name) => (true, name),
			None => (false, &slice[1..]),
		};

		let Some(tag) = recognize_tag(name, source.as_bytes().get(name_end).copied()) else {
			self.push_text(start, name_end);
			return;
		};

		if is_close {
			self.process_close_tag(tag, start, name_end);
		} else {
			self.process_open_tag(tag, start, name_end);
		}
	}

	fn process_close_tag(&mut self, tag: TagName, start: usize, name_end: usize) {
		let source = self.source;
		let rest = &source[name_end..];
		let whitespace = rest.len() - rest.trim_start().len();
		if rest[whitespace..].starts_with('>') {
			let end = name_end + whitespace + 1;
			self.push_token(
				TokenKind::CloseTag(tag),
				source[start..end].to_string(),
				start,
				None,
			);
			self.consume_until(end);
		} else {
			self.push_text(start, name_end);
		}
	}

	fn process_open_tag(&mut self, tag: TagName, start: usize, name_end: usize) {
		let source = self.source;
		let Some(tag_end) = find_tag_end(source.as_bytes(), name_end) else {
			// No closing `>` outside quotes: keep the fragment as text.
			self.push_text(start, name_end);
			return;
		};

		let inner = &source[name_end..tag_end.close];
		let attributes = parse_attributes(inner);
		let condition = match tag {
			TagName::If | TagName::ElseIf => attributes.get("condition").map(str::to_string),
			_ => None,
		};
		let loop_spec = match tag {
			TagName::ForEach => {
				let variable = attributes.get("var").unwrap_or_default();
				let collection = attributes.get("in").unwrap_or_default();
				Some(format!("{variable}|{collection}"))
			}
			_ => None,
		};

		let kind = if tag_end.self_closing {
			TokenKind::SelfClosingTag(tag)
		} else {
			TokenKind::OpenTag(tag)
		};
		let end = tag_end.close + 1;
		self.push_token(
			kind,
			source[start..end].to_string(),
			start,
			Some(TagMeta {
				attributes,
				condition,
				loop_spec,
			}),
		);
		self.consume_until(end);
	}
}

/// Scan template text into tokens in a single pass.
///
/// The scanner never fails: anything that does not form valid template syntax
/// is emitted as text.
pub fn scan(source: &str) -> Vec<Token> {
	Scanner::new(source).process()
}

/// A tag name is accepted when it is in the vocabulary (ignoring case), starts
/// with an uppercase letter and is followed by whitespace, `>` or `/`.
fn recognize_tag(name: &str, next: Option<u8>) -> Option<TagName> {
	if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
		return None;
	}

	match next {
		Some(b'>' | b'/') => {}
		Some(byte) if byte.is_ascii_whitespace() => {}
		_ => return None,
	}

	TagName::from_name(name)
}

pub(crate) struct TagEnd {
	/// Offset of the closing `>`.
	pub close: usize,
	pub self_closing: bool,
}

/// Find the `>` that ends a tag, ignoring any inside quoted attribute values.
/// A backslash inside quotes escapes the next byte.
pub(crate) fn find_tag_end(source: &[u8], from: usize) -> Option<TagEnd> {
	let mut quote: Option<u8> = None;
	let mut escaped = false;
	let mut last_significant: Option<u8> = None;

	for (offset, &byte) in source.iter().enumerate().skip(from) {
		match quote {
			Some(_) if escaped => escaped = false,
			Some(_) if byte == b'\\' => escaped = true,
			Some(open) => {
				if byte == open {
					quote = None;
				}
			}
			None => {
				match byte {
					b'"' | b'\'' => quote = Some(byte),
					b'>' => {
						return Some(TagEnd {
							close: offset,
							self_closing: last_significant == Some(b'/'),
						});
					}
					_ => {}
				}
			}
		}

		if !byte.is_ascii_whitespace() {
			last_significant = Some(byte);
		}
	}

	None
}

/// Tokens of the attribute list between a tag name and its closing `>`.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t\r\n\f/]+")]
enum AttributeToken {
	#[token("=")]
	Equals,
	#[regex(r#""([^"\\]|\\.)*""#)]
	DoubleQuotedString,
	#[regex(r"'([^'\\]|\\.)*'")]
	SingleQuotedString,
	#[regex(r#"[^ \t\r\n\f/="']+"#)]
	Name,
}

/// Parse `name="value" name='value' name=value name` pairs.
pub(crate) fn parse_attributes(source: &str) -> Attributes {
	let mut attributes = Attributes::default();
	let mut lexer = AttributeToken::lexer(source);
	// A name seen but not yet given a value.
	let mut pending: Option<&str> = None;
	let mut awaiting_quote = false;

	while let Some(token) = lexer.next() {
		match token {
			Ok(AttributeToken::Name) => {
				if let Some(name) = pending.replace(lexer.slice()) {
					attributes.push(name, "");
				}
				awaiting_quote = false;
			}
			Ok(AttributeToken::Equals) => {
				let Some(name) = pending else {
					continue;
				};
				let remainder = lexer.remainder();
				let value = remainder.trim_start();
				if value.starts_with(['"', '\'']) {
					awaiting_quote = true;
					continue;
				}

				// Unquoted values run to the next whitespace.
				let length = value
					.find(|c: char| c.is_ascii_whitespace())
					.unwrap_or(value.len());
				lexer.bump(remainder.len() - value.len() + length);
				let raw = &value[..length];
				attributes.push(name, raw.strip_suffix('/').unwrap_or(raw));
				pending = None;
			}
			Ok(quoted @ (AttributeToken::DoubleQuotedString | AttributeToken::SingleQuotedString)) => {
				if awaiting_quote {
					if let Some(name) = pending.take() {
						let delimiter = if quoted == AttributeToken::DoubleQuotedString {
							'"'
						} else {
							'\''
						};
						attributes.push(name, unquote(lexer.slice(), delimiter));
					}
				}
				awaiting_quote = false;
			}
			Err(()) => awaiting_quote = false,
		}
	}

	if let Some(name) = pending {
		attributes.push(name, "");
	}

	attributes
}

/// Strip the quotes from a quoted attribute value and resolve its escapes.
/// A value whose escapes cannot be resolved is kept as written.
fn unquote(slice: &str, delimiter: char) -> String {
	let inner = &slice[1..slice.len() - 1];
	if !inner.contains('\\') {
		return inner.to_string();
	}

	match delimiter {
		'"' => unescape(slice).unwrap_or_else(|_| inner.to_string()),
		_ => inner.replace("\\'", "'"),
	}
}

pub fn memstr(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack
		.windows(needle.len())
		.position(|window| window == needle)
}

fn count_byte(haystack: &[u8], needle: u8) -> usize {
	haystack.iter().filter(|&&byte| byte == needle).count()
}
