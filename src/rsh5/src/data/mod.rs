mod convert;
pub mod shape;
mod source;
mod stream;

pub use convert::{ConvertContext, ConverterRegistry};
pub use source::DataSource;
pub use stream::{
    ElementStream, ParallelElements, ParallelRows, ParallelTensorSlices, RowStream,
    TensorSliceStream,
};
