//! Byte-range descriptors for chunked uploads.

/// Inclusive byte range of one upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header for this chunk.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Ranges that tile `[0, total)` in `chunk_size` steps. The last range may be
/// shorter and always ends at `total - 1`. An empty file yields no ranges.
pub fn byte_ranges(total: u64, chunk_size: u64) -> impl Iterator<Item = ByteRange> {
    let step = chunk_size.max(1);
    (0..total).step_by(step as usize).map(move |start| ByteRange {
        start,
        end: (start + step).min(total) - 1,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(total: u64, chunk: u64) {
        let ranges: Vec<_> = byte_ranges(total, chunk).collect();
        let mut next = 0;
        for range in &ranges {
            assert_eq!(range.start, next, "gap or overlap at {next}");
            assert!(range.len() <= chunk);
            assert_eq!(range.total, total);
            next = range.end + 1;
        }
        assert_eq!(next, total);
        if total > 0 {
            assert_eq!(ranges.last().unwrap().end, total - 1);
        }
    }

    #[test]
    fn test_ranges_tile_exactly() {
        assert_tiles(10 * 1024 * 1024, 10 * 1024 * 1024);
        assert_tiles(25, 10);
        assert_tiles(30, 10);
        assert_tiles(1, 10);
        assert_tiles(7, 1);
    }

    #[test]
    fn test_short_final_chunk() {
        let ranges: Vec<_> = byte_ranges(25, 10).collect();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].content_range(), "bytes 20-24/25");
        assert_eq!(ranges[2].len(), 5);
    }

    #[test]
    fn test_empty_file_has_no_ranges() {
        assert_eq!(byte_ranges(0, 10).count(), 0);
    }
}
