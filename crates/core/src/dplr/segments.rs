//! Variable-length segment descriptors (`cu_seqlens`).
//!
//! A packed call concatenates N sequences along the time axis. The descriptor
//! holds N+1 offsets, e.g. lengths `[3, 2]` pack as `cu_seqlens = [0, 3, 5]`.
//! [`Segments`] turns a validated descriptor into an explicit list of ranges,
//! one per independent recurrence instance.

use std::ops::Range;

use candle_core::{DType, Tensor};

use crate::error::{DplrError, Result};

/// Validated partition of a packed time axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments {
    ranges: Vec<Range<usize>>,
}

impl Segments {
    /// Validate `cu_seqlens` against the packed length `total_len`.
    ///
    /// Offsets must start at 0, never decrease, and end at `total_len`.
    /// Equal neighbours describe an empty segment, which is allowed.
    pub fn from_cu_seqlens(cu_seqlens: &[usize], total_len: usize) -> Result<Self> {
        let (&first, _) = cu_seqlens
            .split_first()
            .ok_or_else(|| DplrError::segments("must contain at least one offset"))?;
        if first != 0 {
            return Err(DplrError::segments(format!("must start at 0, got {first}")));
        }

        let mut ranges = Vec::with_capacity(cu_seqlens.len() - 1);
        for (i, pair) in cu_seqlens.windows(2).enumerate() {
            let (start, end) = (pair[0], pair[1]);
            if end < start {
                return Err(DplrError::segments(format!(
                    "must be non-decreasing, offset {i} ({start}) > offset {} ({end})",
                    i + 1
                )));
            }
            ranges.push(start..end);
        }

        let last = cu_seqlens[cu_seqlens.len() - 1];
        if last != total_len {
            return Err(DplrError::segments(format!(
                "must end at the packed length {total_len}, got {last}"
            )));
        }

        Ok(Self { ranges })
    }

    /// Read offsets from a 1-D integer tensor (`u8`, `u32` or `i64`).
    pub fn from_tensor(cu_seqlens: &Tensor, total_len: usize) -> Result<Self> {
        let offsets: Vec<usize> = match cu_seqlens.dtype() {
            DType::U8 => cu_seqlens
                .to_vec1::<u8>()?
                .into_iter()
                .map(usize::from)
                .collect(),
            DType::U32 => cu_seqlens
                .to_vec1::<u32>()?
                .into_iter()
                .map(|x| x as usize)
                .collect(),
            DType::I64 => cu_seqlens
                .to_vec1::<i64>()?
                .into_iter()
                .map(|x| {
                    usize::try_from(x)
                        .map_err(|_| DplrError::segments(format!("negative offset {x}")))
                })
                .collect::<Result<_>>()?,
            other => {
                return Err(DplrError::segments(format!(
                    "expected an integer tensor, got {other:?}"
                )))
            }
        };
        Self::from_cu_seqlens(&offsets, total_len)
    }

    /// Number of segments (N).
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.ranges.iter().cloned()
    }

    /// Length of the longest segment.
    pub fn max_len(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).max().unwrap_or(0)
    }
}
