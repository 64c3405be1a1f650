use std::fmt;

/// The number of allocation size buckets in a [`SizeHistogram`].
///
/// Bucket `k` for `k < HISTOGRAM_BUCKET_COUNT - 1` counts blocks with `2^(k-1) < size <= 2^k`
/// (bucket zero counts blocks of exactly one byte). The last bucket counts every block larger
/// than the largest explicit boundary.
pub const HISTOGRAM_BUCKET_COUNT: usize = 30;

/// The largest explicit bucket boundary, in bytes. Larger blocks land in the overflow bucket.
pub const HISTOGRAM_MAX_BOUNDARY: usize = 1 << (HISTOGRAM_BUCKET_COUNT - 2);

/// Returns the bucket index for a given allocation size.
#[must_use]
#[inline]
pub fn histogram_bucket_index(size: usize) -> usize {
    // The bit length of (size - 1) is the exponent of the smallest power of two >= size.
    let exponent = usize::BITS
        .checked_sub(size.saturating_sub(1).leading_zeros())
        .expect("leading zeros never exceed the bit width");

    usize::try_from(exponent)
        .expect("a bit count always fits into usize")
        .min(HISTOGRAM_BUCKET_COUNT - 1)
}

/// Returns the inclusive upper size boundary of a bucket, or `None` for the overflow bucket.
#[must_use]
pub fn histogram_bucket_boundary(index: usize) -> Option<usize> {
    assert!(
        index < HISTOGRAM_BUCKET_COUNT,
        "histogram bucket index {index} out of range"
    );

    (index < HISTOGRAM_BUCKET_COUNT - 1).then(|| 1_usize << index)
}

/// Number of tracked blocks per power-of-two size range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeHistogram {
    counts: [u64; HISTOGRAM_BUCKET_COUNT],
}

impl SizeHistogram {
    /// Creates a histogram with every bucket empty.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counts: [0; HISTOGRAM_BUCKET_COUNT],
        }
    }

    /// Creates a histogram from raw bucket counts.
    #[must_use]
    pub const fn from_counts(counts: [u64; HISTOGRAM_BUCKET_COUNT]) -> Self {
        Self { counts }
    }

    /// Counts one block of the given size.
    #[expect(
        clippy::indexing_slicing,
        reason = "bucket index function never returns an out of range index"
    )]
    pub fn add(&mut self, size: usize) {
        let bucket = &mut self.counts[histogram_bucket_index(size)];
        *bucket = bucket.checked_add(1).expect("histogram bucket overflow");
    }

    /// The raw bucket counts.
    #[must_use]
    pub const fn counts(&self) -> &[u64; HISTOGRAM_BUCKET_COUNT] {
        &self.counts
    }

    /// The sum of all bucket counts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl Default for SizeHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SizeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, count) in self.counts.iter().enumerate() {
            if *count == 0 {
                continue;
            }

            match histogram_bucket_boundary(index) {
                Some(boundary) => writeln!(f, "  <= {boundary:>10} bytes: {count}")?,
                None => writeln!(f, "  >  {HISTOGRAM_MAX_BOUNDARY:>10} bytes: {count}")?,
            }
        }

        Ok(())
    }
}
