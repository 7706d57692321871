use std::collections::HashMap;

use serde::Serialize;

use crate::tokens::Attributes;
use crate::tokens::TagName;

/// A parameter passed to a component or fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Parameter {
	pub name: String,
	/// The raw value expression, resolved at render time.
	pub value: String,
	/// Used when the value resolves to null or empty text.
	pub default: Option<String>,
}

/// How a component reference was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentKind {
	/// `<Include component="path">`
	Include,
	/// A container tag with a `component` attribute, e.g.
	/// `<Nav component="main">`. The container name prefixes the path.
	Container(TagName),
}

/// A reference to an independently loaded component template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentRef {
	pub kind: ComponentKind,
	/// The `component` attribute as written. May contain interpolations.
	pub component: String,
	/// Instance name (`name` attribute).
	pub name: Option<String>,
	/// Legacy instance name (`oldname` attribute).
	pub old_name: Option<String>,
	pub parameters: Vec<Parameter>,
	/// Children outside any named `<Slot>` block.
	pub default_slot: Vec<Node>,
	/// Named `<Slot name="...">` blocks, in source order.
	pub slots: Vec<(String, Vec<Node>)>,
}

impl ComponentRef {
	/// The path handed to the loader, before interpolation.
	pub fn path(&self) -> String {
		match self.kind {
			ComponentKind::Include => self.component.clone(),
			ComponentKind::Container(tag) => {
				format!("{}/{}", tag.as_str().to_lowercase(), self.component)
			}
		}
	}
}

/// One `If`/`ElseIf` arm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Branch {
	pub condition: String,
	pub children: Vec<Node>,
}

/// A syntax tree node. Nodes are immutable once parsed and may be shared
/// between concurrent renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Node {
	/// Literal text emitted verbatim.
	Text(String),
	/// `{{ expression }}`
	Interpolation(String),
	/// A container tag without a `component` attribute. Only its children
	/// are rendered.
	Container {
		tag: TagName,
		attributes: Attributes,
		children: Vec<Node>,
	},
	/// `<If>` with its `ElseIf` arms and optional `Else`.
	Conditional {
		branches: Vec<Branch>,
		otherwise: Option<Vec<Node>>,
	},
	/// `<ForEach var="x" in="items">`
	Loop {
		variable: String,
		collection: String,
		children: Vec<Node>,
	},
	/// `<Include>` or a container used as a component.
	Component(ComponentRef),
	/// `<Layout name="n">`: children fill the named layout.
	Layout { name: String, children: Vec<Node> },
	/// `<Section name="s">`: content for a layout section.
	Section { name: String, children: Vec<Node> },
	/// `<RenderSection name="s">` placeholder inside a layout.
	RenderSection {
		name: String,
		required: bool,
		default: Vec<Node>,
	},
	/// `<RenderBody/>` placeholder inside a layout.
	RenderBody,
	/// `<Slot name="s">` placeholder inside a component.
	Slot { name: String, default: Vec<Node> },
	/// `<Define name="f">`: registers a fragment, renders nothing.
	FragmentDefine { name: String, body: Vec<Node> },
	/// `<Render name="f" .../>`
	FragmentInvoke {
		name: String,
		parameters: Vec<Parameter>,
	},
}

impl Node {
	/// Direct child lists of this node, including slot and branch bodies.
	pub fn child_lists(&self) -> Vec<&[Node]> {
		match self {
			Self::Text(_)
			| Self::Interpolation(_)
			| Self::RenderBody
			| Self::FragmentInvoke { .. } => Vec::new(),
			Self::Container { children, .. }
			| Self::Loop { children, .. }
			| Self::Layout { children, .. }
			| Self::Section { children, .. } => vec![children],
			Self::Conditional {
				branches,
				otherwise,
			} => {
				branches
					.iter()
					.map(|branch| branch.children.as_slice())
					.chain(otherwise.as_deref())
					.collect()
			}
			Self::Component(component) => {
				std::iter::once(component.default_slot.as_slice())
					.chain(component.slots.iter().map(|(_, nodes)| nodes.as_slice()))
					.collect()
			}
			Self::RenderSection { default, .. } | Self::Slot { default, .. } => vec![default],
			Self::FragmentDefine { body, .. } => vec![body],
		}
	}
}

/// Visit every node below `nodes` depth first, parents before children.
pub fn walk<'a>(nodes: &'a [Node], visit: &mut impl FnMut(&'a Node)) {
	for node in nodes {
		visit(node);
		for children in node.child_lists() {
			walk(children, visit);
		}
	}
}

/// The root of a parsed template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Root {
	pub children: Vec<Node>,
	/// Lowercased section name to the child-index path of its first
	/// `<Section>` node.
	#[serde(skip)]
	sections: HashMap<String, Vec<usize>>,
}

impl Root {
	pub fn new(children: Vec<Node>) -> Self {
		let mut sections = HashMap::new();
		index_sections(&children, &mut Vec::new(), &mut sections);
		Self { children, sections }
	}

	/// The first `<Section>` node with the given name, ignoring case.
	pub fn section(&self, name: &str) -> Option<&Node> {
		let path = self.sections.get(&name.to_lowercase())?;
		let (last, parents) = path.split_last()?;
		let mut nodes = self.children.as_slice();
		for &index in parents {
			nodes = match nodes.get(index)? {
				Node::Container { children, .. }
				| Node::Layout { children, .. }
				| Node::Loop { children, .. } => children,
				_ => return None,
			};
		}
		nodes.get(*last)
	}

	/// Names of every declared section, sorted.
	pub fn section_names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.sections.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	/// Paths of every component referenced anywhere in the tree, in source
	/// order and without duplicates.
	pub fn component_refs(&self) -> Vec<String> {
		let mut refs: Vec<String> = Vec::new();
		walk(&self.children, &mut |node| {
			if let Node::Component(component) = node {
				let path = component.path();
				if !refs.contains(&path) {
					refs.push(path);
				}
			}
		});
		refs
	}
}

/// Sections are indexed through plain containers, layouts and loops only;
/// sections inside conditionals or components are not addressable by path.
fn index_sections(nodes: &[Node], path: &mut Vec<usize>, index: &mut HashMap<String, Vec<usize>>) {
	for (position, node) in nodes.iter().enumerate() {
		path.push(position);
		match node {
			Node::Section { name, .. } => {
				index.entry(name.to_lowercase()).or_insert_with(|| path.clone());
			}
			Node::Container { children, .. }
			| Node::Layout { children, .. }
			| Node::Loop { children, .. } => index_sections(children, path, index),
			_ => {}
		}
		path.pop();
	}
}
