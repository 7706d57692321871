//! `tessera_core` is the core library for the tessera template engine. It
//! renders HTML templates that embed a small set of PascalCase control tags,
//! `{{ expression }}` interpolations and reusable components, and it treats
//! every template as untrusted input.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Template text
//!   → Security gate (size, interpolation count, nesting depth, inline scripts)
//!   → Scanner (splits text, interpolations and recognised tags into tokens)
//!   → Parser (builds a tree of conditionals, loops, components and layouts)
//!   → Evaluator (walks the tree against layered variables, encoding output)
//! ```
//!
//! Parsed trees, file contents and rendered pages are cached by the
//! [`Engine`].
//!
//! ## Modules
//!
//! - [`config`] loads `tessera.toml`: template directories, security settings,
//!   resource limits and cache capacities.
//! - [`security`] holds the validation functions every expression, condition,
//!   property path and file path passes through before use.
//! - [`expression`] evaluates comparisons, arithmetic and boolean logic over
//!   resolved values.
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_core::Engine;
//! use tessera_core::Variables;
//!
//! let engine = Engine::default();
//! let mut data = Variables::new();
//! data.insert("user", "Ada");
//! data.insert("admin", true);
//!
//! let html = engine
//! 	.render("<If condition=\"admin\">Hi {{ user }}</If>", &data)
//! 	.unwrap();
//! assert_eq!(html, "Hi Ada");
//! ```

pub use ast::*;
pub use cache::CacheStats;
pub use cache::EngineCacheStats;
pub use cache::TemplateKey;
pub use component::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use expression::Bindings;
pub use filters::*;
pub use globals::*;
pub use lexer::memstr;
pub use lexer::scan;
pub use parser::*;
pub use resolver::*;
pub use tokens::*;
pub use value::*;
pub use variables::*;

mod ast;
mod cache;
mod component;
pub mod config;
mod engine;
#[allow(unused_assignments)]
mod error;
mod evaluator;
pub mod expression;
mod filters;
mod globals;
mod lexer;
mod parser;
mod resolver;
pub mod security;
mod shard;
mod tokens;
mod value;
mod variables;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
