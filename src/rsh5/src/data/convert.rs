use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use paste::paste;

use crate::format::{
    DataObject, Datatype, DatatypeProperties, FixedPointSpec, FixedPointValue, H5File, HdfError,
    Result, Selection, StringPadding,
};

/// Everything a converter may need beyond the element bytes: the element's
/// datatype and the open file, for indirections through the global heap.
pub struct ConvertContext<'f> {
    pub file: &'f H5File,
    pub datatype: &'f Datatype,
}

impl<'f> ConvertContext<'f> {
    pub fn new(file: &'f H5File, datatype: &'f Datatype) -> ConvertContext<'f> {
        ConvertContext { file, datatype }
    }

    /// The same context narrowed to a nested datatype (a compound member,
    /// an enum base, an array element).
    pub fn with_datatype<'a>(&'a self, datatype: &'a Datatype) -> ConvertContext<'a> {
        ConvertContext {
            file: self.file,
            datatype,
        }
    }

    /// Wraps the element bytes of an integer-like datatype in the
    /// fixed-point engine. Enums convert through their base type, TIME
    /// values through a full-width signed word.
    pub fn integer_value(&self, bytes: &[u8], target: &'static str) -> Result<FixedPointValue> {
        match &self.datatype.properties {
            DatatypeProperties::FixedPoint(spec) | DatatypeProperties::BitField(spec) => {
                FixedPointValue::new(bytes.to_vec(), *spec)
            }
            DatatypeProperties::Time { big_endian, .. } => FixedPointValue::new(
                bytes.to_vec(),
                FixedPointSpec {
                    size: self.datatype.size as u8,
                    big_endian: *big_endian,
                    signed: true,
                    lo_pad: false,
                    hi_pad: false,
                    bit_offset: 0,
                    bit_precision: self.datatype.size as u16 * 8,
                },
            ),
            DatatypeProperties::Enum { base, .. } => {
                self.with_datatype(base).integer_value(bytes, target)
            }
            _ => Err(HdfError::NoConverter(target)),
        }
    }

    /// Raw fixed-point word of a FIXED or BITFIELD element, extraction not
    /// applied. This is the access path for packed members whose sub-word
    /// interpretation belongs to the application.
    pub fn raw_value(&self, bytes: &[u8]) -> Result<FixedPointValue> {
        match self.datatype.fixed_point_spec() {
            Some(spec) => FixedPointValue::new(bytes.to_vec(), *spec),
            None => Err(HdfError::NoConverter("FixedPointValue")),
        }
    }

    pub fn vlen_bytes(&self, element: &[u8]) -> Result<Vec<u8>> {
        self.file.vlen_bytes(element)
    }

    /// Converts the named member of a compound element through the
    /// registry.
    pub fn compound_field<T: 'static>(&self, element: &[u8], name: &str) -> Result<T> {
        let member = self.member_bytes(element, name)?;
        self.file
            .converters()
            .convert(&self.with_datatype(member.0), member.1)
    }

    /// The named member as a raw fixed-point value.
    pub fn compound_field_raw(&self, element: &[u8], name: &str) -> Result<FixedPointValue> {
        let member = self.member_bytes(element, name)?;
        self.with_datatype(member.0).raw_value(member.1)
    }

    fn member_bytes<'a>(&'a self, element: &'a [u8], name: &str) -> Result<(&'a Datatype, &'a [u8])> {
        let member = self
            .datatype
            .member(name)
            .ok_or_else(|| HdfError::NotFound(format!("no compound member named '{name}'")))?;
        let start = member.byte_offset as usize;
        let len = member.byte_size() as usize;
        if start + len > element.len() {
            return Err(HdfError::CorruptFile(format!(
                "member '{name}' outside the element buffer"
            )));
        }
        Ok((&member.datatype, &element[start..start + len]))
    }
}

macro_rules! register_integer_converters {
    ($registry:ident, $($ty:ty)*) => {
        paste! {
            $(
                $registry.register::<$ty, _>(|cx, bytes| {
                    cx.integer_value(bytes, stringify!($ty))?.[<to_ $ty>]()
                });
            )*
        }
    };
}

trait ErasedConverter: Send + Sync {
    fn convert_boxed(&self, cx: &ConvertContext<'_>, bytes: &[u8]) -> Result<Box<dyn Any>>;
}

struct TypedConverter<T> {
    convert: Box<dyn Fn(&ConvertContext<'_>, &[u8]) -> Result<T> + Send + Sync>,
}

impl<T: 'static> ErasedConverter for TypedConverter<T> {
    fn convert_boxed(&self, cx: &ConvertContext<'_>, bytes: &[u8]) -> Result<Box<dyn Any>> {
        Ok(Box::new((self.convert)(cx, bytes)?))
    }
}

/// The file-scoped converter table: target type to conversion function.
///
/// A converter consumes exactly `datatype.size` bytes and must be pure;
/// the registry is populated before the file opens and is read-only
/// afterwards, so lookups need no locking. Applications extend it with
/// converters for their own compound targets.
pub struct ConverterRegistry {
    map: HashMap<TypeId, Arc<dyn ErasedConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> ConverterRegistry {
        ConverterRegistry {
            map: HashMap::new(),
        }
    }

    pub fn register<T, F>(&mut self, convert: F)
    where
        T: 'static,
        F: Fn(&ConvertContext<'_>, &[u8]) -> Result<T> + Send + Sync + 'static,
    {
        self.map.insert(
            TypeId::of::<T>(),
            Arc::new(TypedConverter {
                convert: Box::new(convert),
            }),
        );
    }

    pub fn convert<T: 'static>(&self, cx: &ConvertContext<'_>, bytes: &[u8]) -> Result<T> {
        if bytes.len() != cx.datatype.size as usize {
            return Err(HdfError::CorruptFile(format!(
                "element buffer is {} bytes, datatype says {}",
                bytes.len(),
                cx.datatype.size
            )));
        }
        let converter = self
            .map
            .get(&TypeId::of::<T>())
            .ok_or(HdfError::NoConverter(std::any::type_name::<T>()))?;
        let boxed = converter.convert_boxed(cx, bytes)?;
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| HdfError::NoConverter(std::any::type_name::<T>()))
    }

    /// The default table: primitive integers, floats, strings, raw bytes,
    /// fixed-point words and references.
    pub fn with_defaults() -> ConverterRegistry {
        let mut registry = ConverterRegistry::new();
        register_integer_converters!(registry, i8 i16 i32 i64 u8 u16 u32 u64);

        registry.register::<f32, _>(|cx, bytes| match &cx.datatype.properties {
            DatatypeProperties::FloatingPoint(spec) if spec.is_ieee_single(cx.datatype.size) => {
                let raw: [u8; 4] = bytes.try_into().expect("size checked by registry");
                Ok(if spec.big_endian {
                    f32::from_be_bytes(raw)
                } else {
                    f32::from_le_bytes(raw)
                })
            }
            _ => Err(HdfError::NoConverter("f32")),
        });

        registry.register::<f64, _>(|cx, bytes| match &cx.datatype.properties {
            DatatypeProperties::FloatingPoint(spec) if spec.is_ieee_double(cx.datatype.size) => {
                let raw: [u8; 8] = bytes.try_into().expect("size checked by registry");
                Ok(if spec.big_endian {
                    f64::from_be_bytes(raw)
                } else {
                    f64::from_le_bytes(raw)
                })
            }
            DatatypeProperties::FloatingPoint(spec) if spec.is_ieee_single(cx.datatype.size) => {
                let raw: [u8; 4] = bytes.try_into().expect("size checked by registry");
                Ok(if spec.big_endian {
                    f32::from_be_bytes(raw) as f64
                } else {
                    f32::from_le_bytes(raw) as f64
                })
            }
            DatatypeProperties::FixedPoint(_) | DatatypeProperties::BitField(_) => {
                Ok(cx.integer_value(bytes, "f64")?.to_i128()? as f64)
            }
            _ => Err(HdfError::NoConverter("f64")),
        });

        registry.register::<String, _>(convert_string);

        registry.register::<Vec<u8>, _>(|cx, bytes| match &cx.datatype.properties {
            DatatypeProperties::VariableLength { .. } => cx.vlen_bytes(bytes),
            _ => Ok(bytes.to_vec()),
        });

        registry.register::<FixedPointValue, _>(|cx, bytes| cx.raw_value(bytes));

        registry.register::<Arc<DataObject>, _>(|cx, bytes| match &cx.datatype.properties {
            DatatypeProperties::Reference(_) => cx.file.dereference(bytes),
            _ => Err(HdfError::NoConverter("Arc<DataObject>")),
        });

        registry.register::<(Arc<DataObject>, Selection), _>(|cx, bytes| {
            match &cx.datatype.properties {
                DatatypeProperties::Reference(_) => cx.file.dereference_region(bytes),
                _ => Err(HdfError::NoConverter("(Arc<DataObject>, Selection)")),
            }
        });

        registry
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn convert_string(cx: &ConvertContext<'_>, bytes: &[u8]) -> Result<String> {
    match &cx.datatype.properties {
        DatatypeProperties::String { padding, .. } => {
            let trimmed = match padding {
                StringPadding::NullTerminate | StringPadding::NullPad => {
                    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                    &bytes[..end]
                }
                StringPadding::SpacePad => {
                    let end = bytes
                        .iter()
                        .rposition(|b| *b != b' ')
                        .map(|p| p + 1)
                        .unwrap_or(0);
                    &bytes[..end]
                }
            };
            String::from_utf8(trimmed.to_vec())
                .map_err(|e| HdfError::CorruptFile(format!("string element is not UTF-8: {e}")))
        }
        DatatypeProperties::VariableLength { is_string: true, .. } => {
            let payload = cx.vlen_bytes(bytes)?;
            String::from_utf8(payload)
                .map_err(|e| HdfError::CorruptFile(format!("string element is not UTF-8: {e}")))
        }
        DatatypeProperties::FixedPoint(_)
        | DatatypeProperties::BitField(_)
        | DatatypeProperties::Time { .. } => {
            Ok(cx.integer_value(bytes, "String")?.to_i128()?.to_string())
        }
        DatatypeProperties::FloatingPoint(_) => {
            let value: f64 = cx.file.converters().convert(cx, bytes)?;
            Ok(value.to_string())
        }
        DatatypeProperties::Enum { .. } => match cx.datatype.enum_name(bytes) {
            Some(name) => Ok(name.to_string()),
            None => Ok(cx.integer_value(bytes, "String")?.to_i128()?.to_string()),
        },
        _ => Err(HdfError::NoConverter("String")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_rejects_unknown_target() {
        let registry = ConverterRegistry::with_defaults();
        assert!(registry.map.contains_key(&TypeId::of::<i64>()));
        assert!(!registry.map.contains_key(&TypeId::of::<std::time::Duration>()));
    }
}
