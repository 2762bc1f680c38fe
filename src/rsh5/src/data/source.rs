use std::marker::PhantomData;
use std::sync::Arc;

use crate::format::{DataObject, Dataset, H5File, HdfError, Result};

use super::convert::ConvertContext;
use super::shape;
use super::stream::{
    ElementStream, ParallelElements, ParallelRows, ParallelTensorSlices, RowStream, SourceCore,
    TensorSliceStream,
};

/// A typed view over one dataset.
///
/// The source is stateless with respect to the file position: every
/// operation acquires its own byte range under the channel mutex, so any
/// number of sources and streams may work the same file concurrently.
/// Read-all operations fetch the full range in a single I/O; streams are
/// lazy and fetch one element (or one row / slice) per advance.
pub struct DataSource<'f, T> {
    core: SourceCore<'f, T>,
}

impl H5File {
    /// Resolves `path` to a dataset and wraps it in a typed source.
    pub fn data_source<T: 'static>(&self, path: &str) -> Result<DataSource<'_, T>> {
        let dataset = Arc::new(self.dataset(path)?);
        Ok(DataSource {
            core: SourceCore {
                file: self,
                dataset,
                _marker: PhantomData,
            },
        })
    }
}

impl<'f, T: 'static> DataSource<'f, T> {
    pub fn dataset(&self) -> &Dataset {
        &self.core.dataset
    }

    pub fn shape(&self) -> &[u64] {
        self.core.dataset.shape()
    }

    pub fn rank(&self) -> usize {
        self.core.dataset.rank()
    }

    pub fn element_count(&self) -> u64 {
        self.core.dataset.element_count()
    }

    fn require_rank(&self, expected: usize) -> Result<()> {
        let found = self.rank();
        if found != expected {
            return Err(HdfError::WrongRank { expected, found });
        }
        Ok(())
    }

    pub fn read_scalar(&self) -> Result<T> {
        self.require_rank(0)?;
        self.core.element(0)
    }

    pub fn read_vector(&self) -> Result<Vec<T>> {
        self.require_rank(1)?;
        self.core.run(0, self.element_count())
    }

    pub fn read_matrix(&self) -> Result<Vec<Vec<T>>> {
        self.require_rank(2)?;
        let shape = self.shape().to_vec();
        let mut rows = Vec::with_capacity(shape[0] as usize);
        for row in 0..shape[0] {
            rows.push(self.core.run(row * shape[1], shape[1])?);
        }
        Ok(rows)
    }

    pub fn read_tensor(&self) -> Result<Vec<Vec<Vec<T>>>> {
        self.require_rank(3)?;
        let shape = self.shape().to_vec();
        let per_slice = shape[1] * shape[2];
        let mut slices = Vec::with_capacity(shape[0] as usize);
        for index in 0..shape[0] {
            let flat = self.core.run(index * per_slice, per_slice)?;
            slices.push(super::stream::into_rows(flat, shape[2] as usize));
        }
        Ok(slices)
    }

    /// All elements in row-major order, any rank.
    pub fn read_flattened(&self) -> Result<Vec<T>> {
        self.core.run(0, self.element_count())
    }

    pub fn stream_scalar(&self) -> Result<ElementStream<'f, T>> {
        self.require_rank(0)?;
        Ok(ElementStream {
            core: self.core.clone(),
            next: 0,
            end: 1,
        })
    }

    pub fn stream_vector(&self) -> Result<ElementStream<'f, T>> {
        self.require_rank(1)?;
        Ok(ElementStream {
            core: self.core.clone(),
            next: 0,
            end: self.element_count(),
        })
    }

    /// Lazy stream over all elements in flat row-major order, any rank.
    pub fn stream_flattened(&self) -> ElementStream<'f, T> {
        ElementStream {
            core: self.core.clone(),
            next: 0,
            end: self.element_count(),
        }
    }

    /// One row per advance.
    pub fn stream_matrix(&self) -> Result<RowStream<'f, T>> {
        self.require_rank(2)?;
        let shape = self.shape();
        Ok(RowStream {
            core: self.core.clone(),
            next_row: 0,
            rows: shape[0],
            row_len: shape[1],
        })
    }

    /// One outer slice per advance.
    pub fn stream_tensor(&self) -> Result<TensorSliceStream<'f, T>> {
        self.require_rank(3)?;
        let shape = self.shape();
        Ok(TensorSliceStream {
            core: self.core.clone(),
            next_slice: 0,
            slices: shape[0],
            rows: shape[1],
            cols: shape[2],
        })
    }

    pub fn parallel_stream_vector(&self) -> Result<ParallelElements<'f, T>>
    where
        T: Send,
    {
        self.require_rank(1)?;
        Ok(ParallelElements {
            core: self.core.clone(),
            start: 0,
            end: self.element_count(),
        })
    }

    pub fn parallel_stream_flattened(&self) -> ParallelElements<'f, T>
    where
        T: Send,
    {
        ParallelElements {
            core: self.core.clone(),
            start: 0,
            end: self.element_count(),
        }
    }

    pub fn parallel_stream_matrix(&self) -> Result<ParallelRows<'f, T>>
    where
        T: Send,
    {
        self.require_rank(2)?;
        let shape = self.shape();
        Ok(ParallelRows {
            core: self.core.clone(),
            rows: shape[0],
            row_len: shape[1],
        })
    }

    pub fn parallel_stream_tensor(&self) -> Result<ParallelTensorSlices<'f, T>>
    where
        T: Send,
    {
        self.require_rank(3)?;
        let shape = self.shape();
        Ok(ParallelTensorSlices {
            core: self.core.clone(),
            slices: shape[0],
            rows: shape[1],
            cols: shape[2],
        })
    }

    /// Collapses `axis` with an associative combiner, streaming over the
    /// flattened elements; only the reduced result is materialized. The
    /// result is the reduced shape flattened row-major.
    pub fn reduce_axis(&self, axis: usize, op: impl Fn(T, T) -> T) -> Result<Vec<T>> {
        let full = self.shape().to_vec();
        if axis >= full.len() {
            return Err(HdfError::WrongRank {
                expected: axis + 1,
                found: full.len(),
            });
        }
        let reduced: Vec<u64> = full
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, d)| *d)
            .collect();
        let reduced_len: u64 = reduced.iter().product::<u64>().max(1);

        let mut accumulator: Vec<Option<T>> = Vec::with_capacity(reduced_len as usize);
        accumulator.resize_with(reduced_len as usize, || None);

        for (flat, value) in self.stream_flattened().enumerate() {
            let value = value?;
            let mut coords = shape::coords_of(flat as u64, &full);
            coords.remove(axis);
            let index = shape::flat_of(&coords, &reduced) as usize;
            accumulator[index] = Some(match accumulator[index].take() {
                Some(previous) => op(previous, value),
                None => value,
            });
        }
        // a zero-length axis leaves nothing to combine
        accumulator
            .into_iter()
            .map(|slot| slot.ok_or(HdfError::Undefined))
            .collect()
    }

    /// Applies per-dimension index lists, producing the selected elements
    /// flattened row-major. An empty list for a dimension selects nothing.
    pub fn slice(&self, selections: &[Vec<u64>]) -> Result<Vec<T>> {
        let full = self.shape().to_vec();
        if selections.len() != full.len() {
            return Err(HdfError::WrongRank {
                expected: full.len(),
                found: selections.len(),
            });
        }
        for (axis, (selection, dim)) in selections.iter().zip(&full).enumerate() {
            if let Some(out) = selection.iter().find(|i| **i >= *dim) {
                return Err(HdfError::ValueOutOfRange {
                    target: "slice index",
                    value: format!("{out} on axis {axis} of size {dim}"),
                });
            }
        }
        let total: usize = selections.iter().map(|s| s.len()).product();
        let mut out = Vec::with_capacity(total);
        if total == 0 {
            return Ok(out);
        }

        // odometer over the selection lists, row-major
        let mut positions = vec![0usize; selections.len()];
        loop {
            let coords: Vec<u64> = positions
                .iter()
                .zip(selections)
                .map(|(p, s)| s[*p])
                .collect();
            out.push(self.core.element(shape::flat_of(&coords, &full))?);

            let mut axis = selections.len();
            loop {
                if axis == 0 {
                    return Ok(out);
                }
                axis -= 1;
                positions[axis] += 1;
                if positions[axis] < selections[axis].len() {
                    break;
                }
                positions[axis] = 0;
            }
        }
    }
}

impl H5File {
    /// Typed scalar attribute read through the converter table.
    pub fn attribute_scalar<T: 'static>(&self, object: &DataObject, name: &str) -> Result<T> {
        let attribute = object.attribute(name).ok_or_else(|| {
            HdfError::NotFound(format!(
                "no attribute named '{name}' on '{}'",
                object.name
            ))
        })?;
        if !attribute.dataspace.is_scalar() {
            return Err(HdfError::WrongRank {
                expected: 0,
                found: attribute.dataspace.rank(),
            });
        }
        let cx = ConvertContext::new(self, &attribute.datatype);
        self.converters().convert(&cx, &attribute.data)
    }

    /// Typed vector attribute read.
    pub fn attribute_vector<T: 'static>(&self, object: &DataObject, name: &str) -> Result<Vec<T>> {
        let attribute = object.attribute(name).ok_or_else(|| {
            HdfError::NotFound(format!(
                "no attribute named '{name}' on '{}'",
                object.name
            ))
        })?;
        if attribute.dataspace.rank() != 1 {
            return Err(HdfError::WrongRank {
                expected: 1,
                found: attribute.dataspace.rank(),
            });
        }
        let cx = ConvertContext::new(self, &attribute.datatype);
        let element_size = attribute.datatype.size as usize;
        attribute
            .data
            .chunks_exact(element_size)
            .map(|chunk| self.converters().convert(&cx, chunk))
            .collect()
    }
}
