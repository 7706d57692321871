use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use clap::Parser;
use owo_colors::OwoColorize;
use tessera_cli::Commands;
use tessera_cli::OutputFormat;
use tessera_cli::TesseraCli;
use tessera_core::AnyEmptyResult;
use tessera_core::AnyResult;
use tessera_core::Engine;
use tessera_core::EngineConfig;
use tessera_core::TesseraError;
use tessera_core::Value;
use tessera_core::Variables;
use tracing::debug;
use tracing_subscriber::EnvFilter;

static USE_COLOR: AtomicBool = AtomicBool::new(true);

fn color_enabled() -> bool {
	USE_COLOR.load(Ordering::Relaxed)
}

/// Apply ANSI color codes only when color is enabled.
macro_rules! colored {
	($text:expr,red) => {
		if color_enabled() {
			format!("{}", $text.red())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,green) => {
		if color_enabled() {
			format!("{}", $text.green())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,bold) => {
		if color_enabled() {
			format!("{}", $text.bold())
		} else {
			format!("{}", $text)
		}
	};
}

fn main() {
	let args = TesseraCli::parse();

	// Respect NO_COLOR env var and --no-color flag.
	let use_color = !args.no_color && std::env::var_os("NO_COLOR").is_none();
	if !use_color {
		USE_COLOR.store(false, Ordering::Relaxed);
	}

	init_tracing(args.verbose, use_color);

	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	let result = match &args.command {
		Some(Commands::Render {
			file,
			root,
			data,
			vars,
			page,
		}) => run_render(file, root.as_deref(), data.as_deref(), vars, *page),
		Some(Commands::Check { file, root, format }) => run_check(file, root.as_deref(), *format),
		None => {
			eprintln!("No subcommand specified. Run `tessera --help` for usage.");
			process::exit(1);
		}
	};

	if let Err(e) = result {
		match e.downcast::<TesseraError>() {
			Ok(error) => {
				let report: miette::Report = (*error).into();
				eprintln!("{report:?}");
			}
			Err(e) => {
				eprintln!("{} {e}", colored!("error:", red));
			}
		}
		process::exit(2);
	}
}

/// Logs go to stderr so rendered output on stdout stays clean.
fn init_tracing(verbose: bool, use_color: bool) {
	let fallback = if verbose { "debug" } else { "warn" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.with_target(false)
		.init();
}

/// The explicit root, or the directory holding `file`.
fn template_root(file: &Path, root: Option<&Path>) -> std::io::Result<PathBuf> {
	let root = match root {
		Some(root) => root.to_path_buf(),
		None => {
			file.parent()
				.filter(|parent| !parent.as_os_str().is_empty())
				.map_or_else(|| PathBuf::from("."), Path::to_path_buf)
		}
	};

	std::fs::canonicalize(root)
}

fn load_variables(data: Option<&Path>, vars: &[(String, String)]) -> AnyResult<Variables> {
	let mut variables = Variables::new();

	if let Some(data) = data {
		let content = std::fs::read_to_string(data)?;
		let serde_json::Value::Object(entries) = serde_json::from_str(&content)? else {
			return Err(format!("{} must contain a JSON object", data.display()).into());
		};
		for (name, value) in entries {
			variables.insert(name, Value::from(value));
		}
	}

	for (name, value) in vars {
		variables.insert(name.as_str(), value.as_str());
	}

	Ok(variables)
}

fn run_render(
	file: &Path,
	root: Option<&Path>,
	data: Option<&Path>,
	vars: &[(String, String)],
	page: bool,
) -> AnyEmptyResult {
	let root = template_root(file, root)?;
	let engine = Engine::from_root(&root)?;
	let variables = load_variables(data, vars)?;

	let target = if file.is_file() {
		std::fs::canonicalize(file)?
	} else {
		file.to_path_buf()
	};
	debug!(root = %root.display(), file = %target.display(), page, "rendering template");

	let output = engine.render_file(&target, &variables, page)?;
	print!("{output}");

	Ok(())
}

fn run_check(file: &Path, root: Option<&Path>, format: OutputFormat) -> AnyEmptyResult {
	let root = template_root(file, root)?;
	let config = EngineConfig::load(&root)?.unwrap_or_default();
	let engine = Engine::new(config);

	let source = std::fs::read_to_string(file)?;
	let prepared = engine.prepare_template(&source)?;
	let sections = prepared.tree.section_names();

	match format {
		OutputFormat::Text => {
			println!("{} {}", colored!("valid:", green), file.display());
			print_list("Components", &prepared.component_refs);
			print_list("Sections", &sections);
		}
		OutputFormat::Json => {
			let output = serde_json::json!({
				"file": file.display().to_string(),
				"valid": true,
				"bytes": source.len(),
				"components": prepared.component_refs,
				"sections": sections,
			});
			println!("{}", serde_json::to_string_pretty(&output)?);
		}
	}

	Ok(())
}

fn print_list(title: &str, items: &[impl Display]) {
	if items.is_empty() {
		println!("{title}: none");
		return;
	}

	println!("{}", colored!(format!("{title}:"), bold));
	for item in items {
		println!("  {item}");
	}
}
