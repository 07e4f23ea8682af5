//! Partitioning a transfer into bounded slices.

/// One backend call's worth of a larger transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    /// Offset into the device buffer.
    pub buffer_offset: usize,
    /// Offset into the file.
    pub file_offset: u64,
    pub len: usize,
}

/// Largest file offset a backend call can address; `off_t` is signed.
pub const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

/// End of `[offset, offset + size)`, or `None` when it lies beyond
/// [`MAX_FILE_OFFSET`].
pub fn range_end(offset: u64, size: usize) -> Option<u64> {
    offset
        .checked_add(size as u64)
        .filter(|&end| end <= MAX_FILE_OFFSET)
}

/// Number of slices of at most `max_slice` bytes covering `size` bytes.
pub fn slice_count(size: usize, max_slice: usize) -> usize {
    size.div_ceil(max_slice)
}

/// Split `[file_offset, file_offset + size)` into consecutive slices of
/// `max_slice` bytes; the last one holds the remainder. A zero `max_slice` is
/// treated as one byte.
pub fn plan_slices(file_offset: u64, size: usize, max_slice: usize) -> Vec<Slice> {
    let max_slice = max_slice.max(1);
    let count = slice_count(size, max_slice);
    let mut slices = Vec::with_capacity(count);
    let mut buffer_offset = 0;
    while buffer_offset < size {
        let len = max_slice.min(size - buffer_offset);
        slices.push(Slice {
            buffer_offset,
            file_offset: file_offset + buffer_offset as u64,
            len,
        });
        buffer_offset += len;
    }
    slices
}
