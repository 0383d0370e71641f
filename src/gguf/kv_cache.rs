//! Key-Value cache for autoregressive decoding
//!
//! One flat buffer per layer, `[max_seq_len, kv_dim]`, written at the
//! position of each decode step and read back as a prefix during attention.

/// Key-Value cache for autoregressive generation
///
/// # Example
///
/// ```
/// use deltavox::gguf::KVCache;
///
/// let mut cache = KVCache::new(2, 8, 16); // 2 layers, kv_dim 8, 16 positions
/// cache.store(0, 0, &[0.1; 8], &[0.2; 8]);
/// assert_eq!(cache.keys(0, 1).len(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Key cache: [num_layers][max_seq_len * kv_dim]
    k_cache: Vec<Vec<f32>>,
    /// Value cache: [num_layers][max_seq_len * kv_dim]
    v_cache: Vec<Vec<f32>>,
    kv_dim: usize,
    max_seq_len: usize,
}

impl KVCache {
    /// Allocate a zeroed cache
    #[must_use]
    pub fn new(num_layers: usize, kv_dim: usize, max_seq_len: usize) -> Self {
        Self {
            k_cache: vec![vec![0.0; max_seq_len * kv_dim]; num_layers],
            v_cache: vec![vec![0.0; max_seq_len * kv_dim]; num_layers],
            kv_dim,
            max_seq_len,
        }
    }

    /// Store the key and value vectors of `layer` at `position`
    ///
    /// Callers check `position < max_seq_len` first.
    pub fn store(&mut self, layer: usize, position: usize, k: &[f32], v: &[f32]) {
        debug_assert!(position < self.max_seq_len);
        let start = position * self.kv_dim;
        let end = start + self.kv_dim;
        self.k_cache[layer][start..end].copy_from_slice(k);
        self.v_cache[layer][start..end].copy_from_slice(v);
    }

    /// Keys of `layer` for positions `0..len`
    #[must_use]
    pub fn keys(&self, layer: usize, len: usize) -> &[f32] {
        &self.k_cache[layer][..len * self.kv_dim]
    }

    /// Values of `layer` for positions `0..len`
    #[must_use]
    pub fn values(&self, layer: usize, len: usize) -> &[f32] {
        &self.v_cache[layer][..len * self.kv_dim]
    }

    /// Positions the cache can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_seq_len
    }

    /// Zero every layer
    pub fn reset(&mut self) {
        for layer in self.k_cache.iter_mut().chain(self.v_cache.iter_mut()) {
            layer.fill(0.0);
        }
    }
}
