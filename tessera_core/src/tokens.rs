use std::fmt::Display;

use derive_more::Deref;
use derive_more::DerefMut;
use serde::Serialize;

/// The closed vocabulary of template tags.
///
/// A tag is only recognized when its first character is uppercase; a
/// lowercase `<nav>` or `<slot>` is ordinary HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TagName {
	/// `<Element>` container.
	Element,
	/// `<Data>` container.
	Data,
	/// `<Nav>` container.
	Nav,
	/// `<Block>` container.
	Block,
	/// `<If condition="...">`
	If,
	/// `<ElseIf condition="...">`
	ElseIf,
	/// `<Else>`
	Else,
	/// `<ForEach var="x" in="items">`
	ForEach,
	/// `<Include component="path">`
	Include,
	/// `<Param name="k" value="v" default="d"/>`
	Param,
	/// `<Slot name="s">`
	Slot,
	/// `<Layout name="n">`
	Layout,
	/// `<Section name="s">`
	Section,
	/// `<RenderSection name="s" required="true">`
	RenderSection,
	/// `<RenderBody/>`
	RenderBody,
	/// `<Define name="f">`
	Define,
	/// `<Render name="f" .../>`
	Render,
}

impl TagName {
	pub const ALL: [TagName; 17] = [
		Self::Element,
		Self::Data,
		Self::Nav,
		Self::Block,
		Self::If,
		Self::ElseIf,
		Self::Else,
		Self::ForEach,
		Self::Include,
		Self::Param,
		Self::Slot,
		Self::Layout,
		Self::Section,
		Self::RenderSection,
		Self::RenderBody,
		Self::Define,
		Self::Render,
	];

	/// Match a tag name ignoring case.
	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL
			.into_iter()
			.find(|tag| tag.as_str().eq_ignore_ascii_case(name))
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Element => "Element",
			Self::Data => "Data",
			Self::Nav => "Nav",
			Self::Block => "Block",
			Self::If => "If",
			Self::ElseIf => "ElseIf",
			Self::Else => "Else",
			Self::ForEach => "ForEach",
			Self::Include => "Include",
			Self::Param => "Param",
			Self::Slot => "Slot",
			Self::Layout => "Layout",
			Self::Section => "Section",
			Self::RenderSection => "RenderSection",
			Self::RenderBody => "RenderBody",
			Self::Define => "Define",
			Self::Render => "Render",
		}
	}

	/// Container tags render their children, or a component when they carry
	/// a `component` attribute.
	pub fn is_container(self) -> bool {
		matches!(self, Self::Element | Self::Data | Self::Nav | Self::Block)
	}
}

impl Display for TagName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A single `name="value"` pair from a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
	pub name: String,
	pub value: String,
}

/// Attributes of a tag in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deref, DerefMut)]
pub struct Attributes(
	#[deref]
	#[deref_mut]
	Vec<Attribute>,
);

impl Attributes {
	/// Look up an attribute value, ignoring the case of its name.
	pub fn get(&self, name: &str) -> Option<&str> {
		self.0
			.iter()
			.find(|attribute| attribute.name.eq_ignore_ascii_case(name))
			.map(|attribute| attribute.value.as_str())
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push(Attribute {
			name: name.into(),
			value: value.into(),
		});
	}
}

impl FromIterator<(String, String)> for Attributes {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Self(
			iter.into_iter()
				.map(|(name, value)| Attribute { name, value })
				.collect(),
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
	/// Literal text, including HTML comments and anything not recognized.
	Text,
	/// A `{{ expr }}` span. The token value is the trimmed expression.
	Interpolation,
	/// `<Tag ...>`
	OpenTag(TagName),
	/// `<Tag .../>`
	SelfClosingTag(TagName),
	/// `</Tag>`
	CloseTag(TagName),
}

/// Metadata extracted from a tag while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagMeta {
	pub attributes: Attributes,
	/// The `condition` attribute of `If`/`ElseIf`.
	pub condition: Option<String>,
	/// `var|collection` for `ForEach`.
	pub loop_spec: Option<String>,
}

/// A token produced once by the scanner and consumed once by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
	pub kind: TokenKind,
	/// Raw source text for text and tags, the trimmed expression for
	/// interpolations.
	pub value: String,
	/// Byte offset of the token in the template.
	pub offset: usize,
	/// 1-indexed line of the token start.
	pub line: usize,
	pub meta: Option<TagMeta>,
}

impl Token {
	/// The tag this token opens, closes or self-closes.
	pub fn tag(&self) -> Option<TagName> {
		match self.kind {
			TokenKind::OpenTag(tag) | TokenKind::SelfClosingTag(tag) | TokenKind::CloseTag(tag) => {
				Some(tag)
			}
			TokenKind::Text | TokenKind::Interpolation => None,
		}
	}

	pub fn attribute(&self, name: &str) -> Option<&str> {
		self.meta.as_ref()?.attributes.get(name)
	}

	pub fn attributes(&self) -> Attributes {
		self.meta
			.as_ref()
			.map(|meta| meta.attributes.clone())
			.unwrap_or_default()
	}

	pub fn is_close(&self, tag: TagName) -> bool {
		self.kind == TokenKind::CloseTag(tag)
	}

	pub fn is_open(&self, tag: TagName) -> bool {
		matches!(self.kind, TokenKind::OpenTag(t) | TokenKind::SelfClosingTag(t) if t == tag)
	}
}
