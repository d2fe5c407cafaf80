//! Chunked query planning for bounded `IN` queries.

use std::collections::BTreeSet;

/// Ordered groups of keys, each no larger than the chunk size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<Vec<String>>,
}

impl ChunkPlan {
    /// Split a key set into chunks of at most `chunk_size` keys.
    ///
    /// Keys are visited in sorted order, so the same set always produces the
    /// same chunks. A `chunk_size` of zero is treated as one.
    pub fn new(keys: &BTreeSet<String>, chunk_size: usize) -> Self {
        let size = chunk_size.max(1);
        let keys: Vec<String> = keys.iter().cloned().collect();
        Self {
            chunks: keys.chunks(size).map(<[String]>::to_vec).collect(),
        }
    }

    pub fn chunks(&self) -> &[Vec<String>] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Vec<String>> {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of keys across all chunks.
    pub fn key_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Plan chunks for any collection of keys. Duplicates collapse.
pub fn plan<I, S>(keys: I, chunk_size: usize) -> ChunkPlan
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
    ChunkPlan::new(&set, chunk_size)
}
