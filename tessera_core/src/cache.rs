//! The engine's in-memory caches.
//!
//! - [`TreeCache`] maps template content to its parsed tree. Content never
//!   changes under a key, so entries are only ever evicted for space.
//! - [`SourceCache`] maps template files to their text and re-checks the
//!   modification time on every access.
//! - [`OutputCache`] maps caller-supplied keys to rendered text with an
//!   optional expiry.
//!
//! The bounded caches evict the least recently accessed fifth of their
//! entries when they overflow. Any doubt about freshness is treated as a
//! miss.

use std::fmt;
use std::hash::Hash;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::TesseraResult;
use crate::ast::Root;
use crate::shard::ShardedMap;
use crate::variables::to_hex;

/// Key of a parsed template: short templates are keyed by their text, longer
/// ones by a SHA-256 digest of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TemplateKey {
	Literal(String),
	Digest(String),
}

impl TemplateKey {
	pub fn for_source(source: &str, literal_threshold: usize) -> Self {
		if source.len() <= literal_threshold {
			Self::Literal(source.to_string())
		} else {
			Self::Digest(to_hex(&Sha256::digest(source.as_bytes())))
		}
	}
}

impl fmt::Display for TemplateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Literal(text) => write!(f, "literal:{text}"),
			Self::Digest(hex) => write!(f, "sha256:{hex}"),
		}
	}
}

/// Counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
	pub entries: usize,
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
}

/// Counters for every cache of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCacheStats {
	pub templates: CacheStats,
	pub sources: CacheStats,
	pub outputs: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

impl Counters {
	fn hit(&self) {
		self.hits.fetch_add(1, Ordering::Relaxed);
	}

	fn miss(&self) {
		self.misses.fetch_add(1, Ordering::Relaxed);
	}

	fn snapshot(&self, entries: usize) -> CacheStats {
		CacheStats {
			entries,
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
		}
	}

	fn reset(&self) {
		self.hits.store(0, Ordering::Relaxed);
		self.misses.store(0, Ordering::Relaxed);
		self.evictions.store(0, Ordering::Relaxed);
	}
}

#[derive(Debug)]
struct Entry<V> {
	value: V,
	/// Logical clock value of the most recent access.
	last_accessed: AtomicU64,
}

/// A size-bounded concurrent cache with least-recently-accessed eviction.
#[derive(Debug)]
pub(crate) struct BoundedCache<K, V> {
	entries: ShardedMap<K, Entry<V>>,
	capacity: usize,
	clock: AtomicU64,
	counters: Counters,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: ShardedMap::new(),
			capacity: capacity.max(1),
			clock: AtomicU64::new(0),
			counters: Counters::default(),
		}
	}

	fn tick(&self) -> u64 {
		self.clock.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub fn get(&self, key: &K) -> Option<V> {
		self.get_if(key, |_| true)
	}

	/// Return the value when `fresh` accepts it. A rejected entry is removed
	/// and counted as a miss.
	pub fn get_if(&self, key: &K, fresh: impl FnOnce(&V) -> bool) -> Option<V> {
		let now = self.tick();
		let found = self.entries.get_with(key, |entry| {
			if fresh(&entry.value) {
				entry.last_accessed.store(now, Ordering::Relaxed);
				Some(entry.value.clone())
			} else {
				None
			}
		});

		match found {
			Some(Some(value)) => {
				self.counters.hit();
				Some(value)
			}
			Some(None) => {
				self.entries.remove(key);
				self.counters.miss();
				None
			}
			None => {
				self.counters.miss();
				None
			}
		}
	}

	pub fn insert(&self, key: K, value: V) {
		let entry = Entry {
			value,
			last_accessed: AtomicU64::new(self.tick()),
		};
		self.entries.insert(key, entry);

		if self.entries.len() > self.capacity {
			self.evict();
		}
	}

	/// Remove the least recently accessed fifth of the entries.
	fn evict(&self) {
		let mut ages: Vec<(K, u64)> = Vec::new();
		self.entries.for_each(|key, entry| {
			ages.push((key.clone(), entry.last_accessed.load(Ordering::Relaxed)));
		});
		ages.sort_unstable_by_key(|(_, accessed)| *accessed);

		let count = (ages.len() / 5).max(1);
		for (key, _) in ages.into_iter().take(count) {
			self.entries.remove(&key);
		}

		self.counters
			.evictions
			.fetch_add(count as u64, Ordering::Relaxed);
		debug!(evicted = count, "cache overflow");
	}

	pub fn remove(&self, key: &K) -> bool {
		self.entries.remove(key).is_some()
	}

	/// Keep only entries whose key satisfies `keep`. Returns the number
	/// removed.
	pub fn retain_keys(&self, mut keep: impl FnMut(&K) -> bool) -> usize {
		self.entries.retain(|key, _| keep(key))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn clear(&self) {
		self.entries.clear();
		self.counters.reset();
	}

	pub fn stats(&self) -> CacheStats {
		self.counters.snapshot(self.len())
	}
}

/// Parsed trees keyed by template content.
pub(crate) type TreeCache = BoundedCache<TemplateKey, Arc<Root>>;

#[derive(Debug, Clone)]
struct SourceEntry {
	text: Arc<str>,
	modified: SystemTime,
}

/// Result of loading a template file through the [`SourceCache`].
#[derive(Debug)]
pub(crate) struct LoadedSource {
	pub text: Arc<str>,
	pub modified: SystemTime,
	/// The previously cached text when the file changed since it was read.
	pub stale: Option<Arc<str>>,
}

/// Template file contents keyed by absolute path and checked against the
/// file's modification time on every access.
#[derive(Debug, Default)]
pub(crate) struct SourceCache {
	entries: ShardedMap<PathBuf, SourceEntry>,
	counters: Counters,
}

impl SourceCache {
	pub fn load(&self, path: &Path) -> TesseraResult<LoadedSource> {
		let modified = std::fs::metadata(path)?.modified()?;

		let stale = match self.entries.get_cloned(&path.to_path_buf()) {
			Some(entry) if entry.modified == modified => {
				self.counters.hit();
				return Ok(LoadedSource {
					text: entry.text,
					modified,
					stale: None,
				});
			}
			Some(entry) => Some(entry.text),
			None => None,
		};

		self.counters.miss();
		let text: Arc<str> = Arc::from(std::fs::read_to_string(path)?);
		self.entries.insert(
			path.to_path_buf(),
			SourceEntry {
				text: Arc::clone(&text),
				modified,
			},
		);
		debug!(path = %path.display(), reloaded = stale.is_some(), "read template source");

		Ok(LoadedSource {
			text,
			modified,
			stale,
		})
	}

	pub fn clear(&self) {
		self.entries.clear();
		self.counters.reset();
	}

	pub fn stats(&self) -> CacheStats {
		self.counters.snapshot(self.entries.len())
	}
}

#[derive(Debug, Clone)]
pub(crate) struct OutputEntry {
	pub text: Arc<str>,
	pub expires_at: Option<SystemTime>,
	/// Modification time of the source file when the output was rendered.
	pub source_modified: Option<SystemTime>,
}

/// Rendered output keyed by a caller-supplied logical key.
#[derive(Debug)]
pub(crate) struct OutputCache {
	entries: BoundedCache<String, OutputEntry>,
}

impl OutputCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: BoundedCache::new(capacity),
		}
	}

	/// A hit requires an unexpired entry rendered from a source with the same
	/// modification time.
	pub fn get(&self, key: &str, source_modified: Option<SystemTime>) -> Option<Arc<str>> {
		let now = SystemTime::now();
		self.entries
			.get_if(&key.to_string(), |entry| {
				entry.expires_at.is_none_or(|expires_at| now < expires_at)
					&& entry.source_modified == source_modified
			})
			.map(|entry| entry.text)
	}

	pub fn insert(&self, key: String, entry: OutputEntry) {
		self.entries.insert(key, entry);
	}

	pub fn invalidate(&self, key: &str) -> bool {
		self.entries.remove(&key.to_string())
	}

	pub fn invalidate_prefix(&self, prefix: &str) -> usize {
		self.entries.retain_keys(|key| !key.starts_with(prefix))
	}

	pub fn clear(&self) {
		self.entries.clear();
	}

	pub fn stats(&self) -> CacheStats {
		self.entries.stats()
	}
}
