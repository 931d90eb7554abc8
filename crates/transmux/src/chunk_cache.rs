use bytes::{Bytes, BytesMut};

/// Accumulates undersized byte chunks until a consumer has enough to work with.
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: Vec<Bytes>,
    data_len: usize,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.data_len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total number of cached bytes.
    pub fn len(&self) -> usize {
        self.data_len
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Drain the cache into one contiguous buffer.
    ///
    /// A single cached chunk is handed back without copying.
    pub fn flush(&mut self) -> Bytes {
        let data_len = std::mem::take(&mut self.data_len);
        let mut chunks = std::mem::take(&mut self.chunks);
        match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.pop().unwrap_or_default(),
            _ => {
                let mut out = BytesMut::with_capacity(data_len);
                for chunk in &chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.data_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_concatenates_in_order() {
        let mut cache = ChunkCache::new();
        cache.push(Bytes::from_static(b"ab"));
        cache.push(Bytes::new());
        cache.push(Bytes::from_static(b"cde"));
        assert_eq!(cache.len(), 5);

        let out = cache.flush();
        assert_eq!(&out[..], b"abcde");
        assert!(cache.is_empty());
        assert!(cache.flush().is_empty());
    }

    #[test]
    fn test_single_chunk_is_not_copied() {
        let mut cache = ChunkCache::new();
        let chunk = Bytes::from(vec![7u8; 64]);
        let ptr = chunk.as_ptr();
        cache.push(chunk);
        assert_eq!(cache.flush().as_ptr(), ptr);
    }

    #[test]
    fn test_reset_discards_data() {
        let mut cache = ChunkCache::new();
        cache.push(Bytes::from_static(b"xyz"));
        cache.reset();
        assert_eq!(cache.len(), 0);
        assert!(cache.flush().is_empty());
    }
}
