use std::marker::PhantomData;
use std::sync::Arc;

use rayon::iter::plumbing::{bridge_unindexed, Folder, UnindexedConsumer, UnindexedProducer};
use rayon::iter::ParallelIterator;

use crate::format::{Dataset, H5File, Result};

use super::convert::ConvertContext;

/// The shared heart of every stream: the open file, the dataset facet and
/// the target type. Each element access is one byte-range read under the
/// channel mutex followed by a pure conversion; no file state is retained
/// between accesses, which is what makes splitting safe.
pub(crate) struct SourceCore<'f, T> {
    pub(crate) file: &'f H5File,
    pub(crate) dataset: Arc<Dataset>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SourceCore<'_, T> {
    fn clone(&self) -> Self {
        SourceCore {
            file: self.file,
            dataset: Arc::clone(&self.dataset),
            _marker: PhantomData,
        }
    }
}

impl<'f, T: 'static> SourceCore<'f, T> {
    pub(crate) fn convert_bytes(&self, bytes: &[u8]) -> Result<T> {
        let cx = ConvertContext::new(self.file, &self.dataset.datatype);
        self.file.converters().convert(&cx, bytes)
    }

    /// One element, one I/O.
    pub(crate) fn element(&self, flat: u64) -> Result<T> {
        let bytes = self.file.read_element_range(&self.dataset, flat, 1)?;
        self.convert_bytes(&bytes)
    }

    /// A contiguous run of elements, one I/O.
    pub(crate) fn run(&self, start: u64, count: u64) -> Result<Vec<T>> {
        let element_size = self.dataset.datatype.size as usize;
        let bytes = self.file.read_element_range(&self.dataset, start, count)?;
        let mut out = Vec::with_capacity(count as usize);
        for chunk in bytes.chunks_exact(element_size) {
            out.push(self.convert_bytes(chunk)?);
        }
        Ok(out)
    }
}

/// Lazy sequential stream over flattened elements. Finite, not
/// restartable: it completes after exactly `end - start` elements.
pub struct ElementStream<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) next: u64,
    pub(crate) end: u64,
}

impl<T: 'static> Iterator for ElementStream<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let item = self.core.element(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next) as usize;
        (remaining, Some(remaining))
    }
}

/// Lazy sequential stream yielding one row of a rank-2 dataset per
/// advance.
pub struct RowStream<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) next_row: u64,
    pub(crate) rows: u64,
    pub(crate) row_len: u64,
}

impl<T: 'static> Iterator for RowStream<'_, T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.rows {
            return None;
        }
        let item = self.core.run(self.next_row * self.row_len, self.row_len);
        self.next_row += 1;
        Some(item)
    }
}

/// Lazy sequential stream yielding one outer slice (a matrix) of a rank-3
/// dataset per advance.
pub struct TensorSliceStream<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) next_slice: u64,
    pub(crate) slices: u64,
    pub(crate) rows: u64,
    pub(crate) cols: u64,
}

impl<T: 'static> Iterator for TensorSliceStream<'_, T> {
    type Item = Result<Vec<Vec<T>>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_slice >= self.slices {
            return None;
        }
        let per_slice = self.rows * self.cols;
        let item = self
            .core
            .run(self.next_slice * per_slice, per_slice)
            .map(|flat| into_rows(flat, self.cols as usize));
        self.next_slice += 1;
        Some(item)
    }
}

pub(crate) fn into_rows<T>(flat: Vec<T>, cols: usize) -> Vec<Vec<T>> {
    let mut rows = Vec::with_capacity(flat.len() / cols.max(1));
    let mut row = Vec::with_capacity(cols);
    for value in flat {
        row.push(value);
        if row.len() == cols {
            rows.push(std::mem::replace(&mut row, Vec::with_capacity(cols)));
        }
    }
    rows
}

/// Parallel stream over flattened elements. Splits halve the remaining
/// index range; every split covers a contiguous range and re-seeks the
/// channel independently, so element order is preserved within a split
/// and splits interleave arbitrarily.
pub struct ParallelElements<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl<'f, T: Send + 'static> ParallelIterator for ParallelElements<'f, T> {
    type Item = Result<T>;

    fn drive_unindexed<C>(self, consumer: C) -> C::Result
    where
        C: UnindexedConsumer<Self::Item>,
    {
        bridge_unindexed(
            RangeProducer {
                core: self.core,
                start: self.start,
                end: self.end,
                item: element_item,
                _marker: PhantomData,
            },
            consumer,
        )
    }
}

/// Parallel stream over the rows of a rank-2 dataset.
pub struct ParallelRows<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) rows: u64,
    pub(crate) row_len: u64,
}

impl<'f, T: Send + 'static> ParallelIterator for ParallelRows<'f, T> {
    type Item = Result<Vec<T>>;

    fn drive_unindexed<C>(self, consumer: C) -> C::Result
    where
        C: UnindexedConsumer<Self::Item>,
    {
        let row_len = self.row_len;
        bridge_unindexed(
            RangeProducer {
                core: self.core,
                start: 0,
                end: self.rows,
                item: move |core: &SourceCore<'_, T>, row| core.run(row * row_len, row_len),
                _marker: PhantomData,
            },
            consumer,
        )
    }
}

/// Parallel stream over the outer slices of a rank-3 dataset.
pub struct ParallelTensorSlices<'f, T> {
    pub(crate) core: SourceCore<'f, T>,
    pub(crate) slices: u64,
    pub(crate) rows: u64,
    pub(crate) cols: u64,
}

impl<'f, T: Send + 'static> ParallelIterator for ParallelTensorSlices<'f, T> {
    type Item = Result<Vec<Vec<T>>>;

    fn drive_unindexed<C>(self, consumer: C) -> C::Result
    where
        C: UnindexedConsumer<Self::Item>,
    {
        let per_slice = self.rows * self.cols;
        let cols = self.cols as usize;
        bridge_unindexed(
            RangeProducer {
                core: self.core,
                start: 0,
                end: self.slices,
                item: move |core: &SourceCore<'_, T>, slice| {
                    core.run(slice * per_slice, per_slice)
                        .map(|flat| into_rows(flat, cols))
                },
                _marker: PhantomData,
            },
            consumer,
        )
    }
}

fn element_item<T: 'static>(core: &SourceCore<'_, T>, flat: u64) -> Result<T> {
    core.element(flat)
}

/// Index-range producer: `split` halves the remaining range, `fold_with`
/// walks it and materializes one item per index.
struct RangeProducer<'f, T, I, F> {
    core: SourceCore<'f, T>,
    start: u64,
    end: u64,
    item: F,
    _marker: PhantomData<fn() -> I>,
}

impl<'f, T, I, F> UnindexedProducer for RangeProducer<'f, T, I, F>
where
    T: 'static,
    I: Send,
    F: Fn(&SourceCore<'f, T>, u64) -> Result<I> + Clone + Send + Sync,
{
    type Item = Result<I>;

    fn split(self) -> (Self, Option<Self>) {
        let len = self.end - self.start;
        if len < 2 {
            return (self, None);
        }
        let mid = self.start + len / 2;
        let right = RangeProducer {
            core: self.core.clone(),
            start: mid,
            end: self.end,
            item: self.item.clone(),
            _marker: PhantomData,
        };
        let left = RangeProducer { end: mid, ..self };
        (left, Some(right))
    }

    fn fold_with<G>(self, mut folder: G) -> G
    where
        G: Folder<Self::Item>,
    {
        for index in self.start..self.end {
            folder = folder.consume((self.item)(&self.core, index));
            if folder.full() {
                break;
            }
        }
        folder
    }
}
