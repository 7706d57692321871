use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Render and validate tessera HTML templates.",
	long_about = "tessera renders HTML templates built from PascalCase control tags, `{{ expression \
	              }}` interpolations and reusable components. Every template is treated as \
	              untrusted input and validated before it is rendered.\n\nQuick start:\n  tessera \
	              render page.html --var Name=Ada   Render a template\n  tessera check \
	              page.html                    Validate a template"
)]
pub struct TesseraCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Enable debug logging. `RUST_LOG` takes precedence when set.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Render a template file and print the output.
	///
	/// Components and layouts are loaded from the template root, which is
	/// configured by a `tessera.toml` found there. Without a config file the
	/// root itself holds pages and components.
	Render {
		/// The template to render. An existing file is used as given;
		/// otherwise the path is resolved inside the pages or components
		/// directory.
		file: PathBuf,

		/// Template root directory. Defaults to the directory containing
		/// the template.
		#[arg(long)]
		root: Option<PathBuf>,

		/// JSON file whose top-level object supplies the variables.
		#[arg(long)]
		data: Option<PathBuf>,

		/// Bind a string variable. May be repeated; overrides `--data`.
		#[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_variable)]
		vars: Vec<(String, String)>,

		/// Resolve a relative path against the pages directory instead of
		/// the components directory.
		#[arg(long, default_value_t = false)]
		page: bool,
	},
	/// Validate and parse a template without rendering it.
	///
	/// Runs the same security checks as rendering and lists the components
	/// the template references and the sections it declares. Exits with a
	/// non-zero status code when the template is rejected.
	Check {
		/// The template file to check.
		file: PathBuf,

		/// Directory holding the `tessera.toml` whose security settings
		/// apply. Defaults to the directory containing the template.
		#[arg(long)]
		root: Option<PathBuf>,

		/// Output format for check results. Use `text` for human-readable
		/// output or `json` for programmatic consumption.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text output with colors and formatting.
	Text,
	/// JSON output for programmatic consumption.
	Json,
}

/// Parse a `NAME=VALUE` binding. The value may contain further `=`.
pub fn parse_variable(text: &str) -> Result<(String, String), String> {
	let Some((name, value)) = text.split_once('=') else {
		return Err(format!("expected NAME=VALUE, got `{text}`"));
	};
	let name = name.trim();
	if name.is_empty() {
		return Err("variable name must not be empty".to_string());
	}

	Ok((name.to_string(), value.to_string()))
}
