use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::hash::Hash;

use parking_lot::RwLock;

const SHARD_COUNT: usize = 16;

/// A hash map split across independently locked shards so that concurrent
/// readers and writers of different keys rarely contend on the same lock.
#[derive(Debug)]
pub(crate) struct ShardedMap<K, V> {
	shards: Vec<RwLock<HashMap<K, V>>>,
	hasher: RandomState,
}

impl<K: Eq + Hash, V> Default for ShardedMap<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
	pub fn new() -> Self {
		Self {
			shards: (0..SHARD_COUNT)
				.map(|_| RwLock::new(HashMap::new()))
				.collect(),
			hasher: RandomState::new(),
		}
	}

	fn shard<Q: Hash + ?Sized>(&self, key: &Q) -> &RwLock<HashMap<K, V>> {
		let hash = self.hasher.hash_one(key);
		// Truncation is fine: only the low bits pick the shard.
		#[allow(clippy::cast_possible_truncation)]
		let index = (hash as usize) % SHARD_COUNT;
		&self.shards[index]
	}

	/// Run `read` against the value under a shared lock.
	pub fn get_with<R>(&self, key: &K, read: impl FnOnce(&V) -> R) -> Option<R> {
		self.shard(key).read().get(key).map(read)
	}

	pub fn insert(&self, key: K, value: V) -> Option<V> {
		self.shard(&key).write().insert(key, value)
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		self.shard(key).write().remove(key)
	}

	/// Keep only the entries for which `keep` returns true. Returns the number
	/// of entries removed.
	pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
		let mut removed = 0;
		for shard in &self.shards {
			let mut shard = shard.write();
			let before = shard.len();
			shard.retain(|key, value| keep(key, value));
			removed += before - shard.len();
		}
		removed
	}

	/// Visit every entry under shared locks, one shard at a time.
	pub fn for_each(&self, mut visit: impl FnMut(&K, &V)) {
		for shard in &self.shards {
			for (key, value) in shard.read().iter() {
				visit(key, value);
			}
		}
	}

	pub fn len(&self) -> usize {
		self.shards.iter().map(|shard| shard.read().len()).sum()
	}

	pub fn clear(&self) {
		for shard in &self.shards {
			shard.write().clear();
		}
	}
}

impl<K: Eq + Hash, V: Clone> ShardedMap<K, V> {
	pub fn get_cloned(&self, key: &K) -> Option<V> {
		self.get_with(key, Clone::clone)
	}

	/// Return the cached value or build and insert it. The shared lock is tried
	/// first; under the exclusive lock the map is checked again so a value
	/// built concurrently by another thread wins.
	pub fn get_or_insert_with(&self, key: K, build: impl FnOnce() -> V) -> V {
		let shard = self.shard(&key);
		if let Some(value) = shard.read().get(&key) {
			return value.clone();
		}

		let value = build();
		shard.write().entry(key).or_insert(value).clone()
	}
}
