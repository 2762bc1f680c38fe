pub mod encode;
mod writer;

pub use writer::{CompoundFileWriter, FieldKind, FieldSpec, Value};
