use std::path::Path;

use assert_cmd::Command;
use insta_cmd::get_cargo_bin;

pub fn tessera_cmd() -> Command {
	let mut cmd = Command::new(get_cargo_bin("tessera"));
	cmd.env("NO_COLOR", "1");
	cmd.env_remove("RUST_LOG");
	cmd
}

#[allow(dead_code)]
pub fn write_file(root: &Path, relative: &str, content: &str) {
	let path = root.join(relative);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create dir: {e}"));
	}
	std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {relative}: {e}"));
}
