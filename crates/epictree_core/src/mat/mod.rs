//! Level-5 MAT-file codec for the interchange document.
//!
//! # Responsibility
//! - Write named `Value` variables as a little-endian MAT v5 file.
//! - Read such files back into `Value` trees.
//!
//! # Invariants
//! - Maps become structs, lists of maps become 1×N struct arrays, other
//!   heterogeneous lists become 1×N cell arrays.
//! - Field and variable names are MATLAB-valid identifiers of at most 63
//!   characters.
//! - Compressed elements are zlib streams of one complete `miMATRIX` element.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod reader;
mod writer;

pub use reader::{from_bytes, read_mat};
pub use writer::{matlab_name, to_bytes, write_mat, WriteOptions};

pub type MatResult<T> = Result<T, MatError>;

pub(crate) const HEADER_LEN: usize = 128;
pub(crate) const HEADER_TEXT_LEN: usize = 116;
pub(crate) const VERSION: u16 = 0x0100;
pub(crate) const MAX_NAME_LEN: usize = 63;

// Data element types.
pub(crate) const MI_INT8: u32 = 1;
pub(crate) const MI_UINT8: u32 = 2;
pub(crate) const MI_INT16: u32 = 3;
pub(crate) const MI_UINT16: u32 = 4;
pub(crate) const MI_INT32: u32 = 5;
pub(crate) const MI_UINT32: u32 = 6;
pub(crate) const MI_SINGLE: u32 = 7;
pub(crate) const MI_DOUBLE: u32 = 9;
pub(crate) const MI_INT64: u32 = 12;
pub(crate) const MI_UINT64: u32 = 13;
pub(crate) const MI_MATRIX: u32 = 14;
pub(crate) const MI_COMPRESSED: u32 = 15;
pub(crate) const MI_UTF8: u32 = 16;
pub(crate) const MI_UTF16: u32 = 17;

// Array classes.
pub(crate) const MX_CELL: u8 = 1;
pub(crate) const MX_STRUCT: u8 = 2;
pub(crate) const MX_CHAR: u8 = 4;
pub(crate) const MX_DOUBLE: u8 = 6;
pub(crate) const MX_SINGLE: u8 = 7;
pub(crate) const MX_INT8: u8 = 8;
pub(crate) const MX_UINT8: u8 = 9;
pub(crate) const MX_UINT64: u8 = 15;
pub(crate) const MX_INT64: u8 = 14;

pub(crate) const FLAG_LOGICAL: u32 = 0x0200;

#[derive(Debug)]
pub enum MatError {
    Io(std::io::Error),
    /// File is shorter than a header or does not carry the `IM` tag.
    InvalidHeader(String),
    /// An element claims more bytes than remain.
    Truncated { offset: usize },
    UnsupportedElement(u32),
    UnsupportedClass(u8),
    /// A single element exceeds the 32-bit size field.
    TooLarge { name: String },
}

impl Display for MatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::InvalidHeader(reason) => write!(f, "invalid MAT-file header: {reason}"),
            Self::Truncated { offset } => write!(f, "truncated data element at byte {offset}"),
            Self::UnsupportedElement(data_type) => {
                write!(f, "unsupported data element type {data_type}")
            }
            Self::UnsupportedClass(class) => write!(f, "unsupported array class {class}"),
            Self::TooLarge { name } => write!(f, "variable `{name}` exceeds the 4 GiB element limit"),
        }
    }
}

impl Error for MatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MatError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{from_bytes, to_bytes, WriteOptions};
    use crate::model::value::{Value, ValueMap};
    use serde_json::json;

    fn roundtrip(variables: &ValueMap, compress: bool) -> ValueMap {
        let bytes = to_bytes(variables, &WriteOptions { compress }).unwrap();
        from_bytes(&bytes).unwrap()
    }

    fn variables(value: serde_json::Value) -> ValueMap {
        match Value::from(value) {
            Value::Map(map) => map,
            _ => ValueMap::new(),
        }
    }

    #[test]
    fn scalars_and_text_survive_both_encodings() {
        let vars = variables(json!({
            "version": "1.0",
            "count": 3,
            "rate": 10000.5,
            "ok": true,
            "note": "",
        }));
        for compress in [false, true] {
            let back = roundtrip(&vars, compress);
            assert_eq!(back.get("version"), Some(&Value::from("1.0")));
            assert_eq!(back.get("count"), Some(&Value::Int(3)));
            assert_eq!(back.get("rate"), Some(&Value::Float(10000.5)));
            assert_eq!(back.get("ok"), Some(&Value::Bool(true)));
            assert_eq!(back.get("note"), Some(&Value::from("")));
        }
    }

    #[test]
    fn struct_arrays_fill_missing_fields() {
        let vars = variables(json!({"items": [{"a": 1}, {"b": "x"}]}));
        let back = roundtrip(&vars, true);
        let records = back.get("items").map(Value::records).unwrap_or_default();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("a"), Some(&Value::Int(1)));
        assert_eq!(records[0].get("b"), Some(&Value::Array(Vec::new())));
        assert_eq!(records[1].get("b"), Some(&Value::from("x")));
    }

    #[test]
    fn empty_map_stays_a_fieldless_struct() {
        let vars = variables(json!({"properties": {}}));
        let back = roundtrip(&vars, false);
        assert_eq!(back.get("properties"), Some(&Value::Map(ValueMap::new())));
    }

    #[test]
    fn mixed_lists_become_cells_and_samples_stay_doubles() {
        let mut vars = variables(json!({"mixed": [1, "two"]}));
        vars.insert("data".to_string(), Value::Array(vec![0.5, -1.0, 2.25]));
        let back = roundtrip(&vars, true);
        assert_eq!(
            back.get("mixed"),
            Some(&Value::List(vec![Value::Int(1), Value::from("two")]))
        );
        assert_eq!(back.get("data"), Some(&Value::Array(vec![0.5, -1.0, 2.25])));
    }

    #[test]
    fn non_ascii_text_uses_utf16() {
        let vars = variables(json!({"label": "Zelle µ-3"}));
        let back = roundtrip(&vars, false);
        assert_eq!(back.get("label"), Some(&Value::from("Zelle µ-3")));
    }
}
