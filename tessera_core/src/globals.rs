//! Process-wide global variables.
//!
//! Globals form the lowest-priority layer of every render environment, below
//! engine instance variables and call-local bindings. The registry starts
//! empty, lives for the whole process and is only emptied by
//! [`clear_globals`]. Each render takes a snapshot when it starts, so changes
//! made while a render is running are seen by the next render only.

use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::TesseraError;
use crate::TesseraResult;
use crate::Value;
use crate::Variables;
use crate::config::SecurityConfig;

static GLOBALS: LazyLock<RwLock<Variables>> = LazyLock::new(|| RwLock::new(Variables::new()));
static DEFAULT_SECURITY: LazyLock<SecurityConfig> = LazyLock::new(SecurityConfig::default);

/// Bind a global variable. Names on the default blocked-property list are
/// rejected.
pub fn set_global(name: impl Into<String>, value: impl Into<Value>) -> TesseraResult<()> {
	let name = name.into();
	if DEFAULT_SECURITY.is_blocked(&name) {
		return Err(TesseraError::UnsafePropertyPath {
			path: name,
			reason: "blocked property names cannot be bound as globals".to_string(),
		});
	}

	GLOBALS.write().insert(name, value);
	Ok(())
}

pub fn get_global(name: &str) -> Option<Value> {
	GLOBALS.read().get(name).cloned()
}

pub fn has_global(name: &str) -> bool {
	GLOBALS.read().contains(name)
}

pub fn remove_global(name: &str) -> Option<Value> {
	GLOBALS.write().remove(name)
}

/// Remove every global variable.
pub fn clear_globals() {
	GLOBALS.write().clear();
}

pub fn global_count() -> usize {
	GLOBALS.read().len()
}

/// A copy of the current globals, used as the bottom layer of a render
/// environment.
pub fn globals_snapshot() -> Variables {
	GLOBALS.read().clone()
}
