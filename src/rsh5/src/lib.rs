mod data;
mod format;
mod write;

pub use data::*;
pub use format::*;
pub use write::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        let image = CompoundFileWriter::new(
            "records",
            vec![FieldSpec::new("id", FieldKind::uint(8))],
        )
        .unwrap()
        .with_attribute("abc123")
        .to_bytes(&[vec![Value::Uint(42)]])
        .unwrap();

        let file = H5File::from_bytes(image).unwrap();
        let root = file.root().unwrap();
        assert_eq!(file.child_names(&root).unwrap(), vec!["records"]);

        let source = file.data_source::<Vec<u8>>("/records").unwrap();
        assert_eq!(source.read_vector().unwrap().len(), 1);
    }
}
