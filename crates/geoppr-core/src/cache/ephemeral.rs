use dashmap::DashMap;

/// In-process key/value store with no expiry.
///
/// Values are replaced whole, so readers see either the previous or the
/// new value. Only `clear` drops entries.
pub struct EphemeralCache<V> {
    entries: DashMap<String, V>,
}

impl<V: Clone> EphemeralCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn save(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for EphemeralCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
