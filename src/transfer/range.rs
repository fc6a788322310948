use std::fmt;

/// A half-open byte interval `[start, end)` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// Create a range covering `[start, end)`. Returns `None` for an empty or inverted range.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start < end).then_some(ByteRange { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// The exclusive end offset.
    pub fn end(&self) -> u64 {
        self.end
    }

    // Ranges are never empty, so there is no `is_empty`.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// The HTTP `Range` header value for this range.
    ///
    /// ```
    /// use cobalt_s3_transfer::transfer::ByteRange;
    ///
    /// let range = ByteRange::new(0, 500).unwrap();
    /// assert_eq!(range.header_value(), "bytes=0-499");
    /// ```
    pub fn header_value(&self) -> String {
        // HTTP ranges are inclusive of the last byte.
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Partition `[0, size)` into consecutive ranges of `step` bytes.
///
/// The final range holds the remainder. A `step` of zero, or one at least as
/// large as `size`, yields a single range covering the whole object. An empty
/// object yields no ranges.
pub fn plan(size: u64, step: u64) -> Vec<ByteRange> {
    if size == 0 {
        return vec![];
    }
    if step == 0 || step >= size {
        return vec![ByteRange {
            start: 0,
            end: size,
        }];
    }
    (0..size.div_ceil(step))
        .map(|i| {
            let start = i * step;
            ByteRange {
                start,
                end: (start + step).min(size),
            }
        })
        .collect()
}
