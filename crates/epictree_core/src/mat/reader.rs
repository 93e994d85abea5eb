//! MAT v5 reader.
//!
//! Decodes the subset written by `writer` plus the common variations MATLAB
//! itself produces: packed small elements, narrower storage types for
//! numeric classes, `miUTF8` text, and multi-dimensional numeric arrays
//! (flattened in column-major order).

use super::{
    MatError, MatResult, FLAG_LOGICAL, HEADER_LEN, MI_COMPRESSED, MI_DOUBLE, MI_INT16, MI_INT32,
    MI_INT64, MI_INT8, MI_MATRIX, MI_SINGLE, MI_UINT16, MI_UINT32, MI_UINT64, MI_UINT8, MI_UTF16,
    MI_UTF8, MX_CELL, MX_CHAR, MX_DOUBLE, MX_INT8, MX_SINGLE, MX_STRUCT, MX_UINT64, MX_UINT8,
};
use crate::model::value::{Value, ValueMap};
use flate2::read::ZlibDecoder;
use log::debug;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Reads every variable of the MAT-file at `path`.
pub fn read_mat(path: &Path) -> MatResult<ValueMap> {
    let bytes = fs::read(path)?;
    from_bytes(&bytes)
}

/// Decodes a complete MAT-file image.
pub fn from_bytes(bytes: &[u8]) -> MatResult<ValueMap> {
    check_header(bytes)?;

    let mut variables = ValueMap::new();
    let mut cursor = Cursor::new(bytes, HEADER_LEN);
    while !cursor.is_done() {
        let element = cursor.next_element()?;
        let (name, value) = match element.data_type {
            MI_MATRIX => parse_matrix(element.data)?,
            MI_COMPRESSED => {
                let inflated = inflate(element.data)?;
                let mut inner = Cursor::new(&inflated, 0);
                let matrix = inner.next_element()?;
                if matrix.data_type != MI_MATRIX {
                    return Err(MatError::UnsupportedElement(matrix.data_type));
                }
                parse_matrix(matrix.data)?
            }
            other => {
                debug!("event=mat_read module=mat status=skipped element_type={other}");
                continue;
            }
        };
        variables.insert(name, value);
    }
    Ok(variables)
}

fn check_header(bytes: &[u8]) -> MatResult<()> {
    if bytes.len() < HEADER_LEN {
        return Err(MatError::InvalidHeader(format!(
            "file is {} bytes, shorter than the header",
            bytes.len()
        )));
    }
    match &bytes[HEADER_LEN - 2..HEADER_LEN] {
        b"IM" => Ok(()),
        b"MI" => Err(MatError::InvalidHeader(
            "big-endian files are not supported".to_string(),
        )),
        _ => Err(MatError::InvalidHeader("missing endian indicator".to_string())),
    }
}

fn inflate(data: &[u8]) -> MatResult<Vec<u8>> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut inflated)?;
    Ok(inflated)
}

struct Element<'a> {
    data_type: u32,
    data: &'a [u8],
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn is_done(&self) -> bool {
        self.pos + 8 > self.bytes.len()
    }

    fn take(&mut self, len: usize) -> MatResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MatError::Truncated { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> MatResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Reads one element; normal elements are followed by 8-byte padding,
    /// compressed ones are not.
    fn next_element(&mut self) -> MatResult<Element<'a>> {
        let first = self.u32()?;
        let packed_len = (first >> 16) as usize;
        if packed_len != 0 {
            let word = self.take(4)?;
            let len = packed_len.min(4);
            return Ok(Element {
                data_type: first & 0xFFFF,
                data: &word[..len],
            });
        }

        let len = self.u32()? as usize;
        let data = self.take(len)?;
        if first != MI_COMPRESSED {
            let padding = (8 - len % 8) % 8;
            self.pos = (self.pos + padding).min(self.bytes.len());
        }
        Ok(Element {
            data_type: first,
            data,
        })
    }
}

/// Parses the body of one `miMATRIX` element into its name and value.
fn parse_matrix(body: &[u8]) -> MatResult<(String, Value)> {
    if body.is_empty() {
        return Ok((String::new(), Value::Array(Vec::new())));
    }

    let mut cursor = Cursor::new(body, 0);
    let flags_element = cursor.next_element()?;
    let flags = as_u32s(&flags_element)?;
    let flag_word = flags.first().copied().unwrap_or(0);
    let class = (flag_word & 0xFF) as u8;
    let logical = flag_word & FLAG_LOGICAL != 0;

    let dims_element = cursor.next_element()?;
    let dims: Vec<usize> = as_i64s(&dims_element)?
        .into_iter()
        .map(|dim| usize::try_from(dim).unwrap_or(0))
        .collect();
    let count: usize = dims.iter().product();

    let name_element = cursor.next_element()?;
    let name = String::from_utf8_lossy(name_element.data).into_owned();

    let value = match class {
        MX_STRUCT => parse_struct(&mut cursor, &dims, count)?,
        MX_CELL => {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(nested_matrix(&mut cursor)?);
            }
            Value::List(items)
        }
        MX_CHAR => {
            let real = cursor.next_element()?;
            Value::Text(decode_text(&real)?)
        }
        MX_DOUBLE | MX_SINGLE => {
            let real = cursor.next_element()?;
            let samples = as_f64s(&real)?;
            if logical {
                bools(samples.iter().map(|s| *s != 0.0).collect())
            } else if samples.len() == 1 {
                Value::Float(samples[0])
            } else {
                Value::Array(samples)
            }
        }
        MX_INT8..=MX_UINT64 => {
            let real = cursor.next_element()?;
            if logical {
                let ints = as_i64s(&real)?;
                bools(ints.iter().map(|i| *i != 0).collect())
            } else if class == MX_UINT8 {
                Value::Bytes(real.data.to_vec())
            } else {
                let ints = as_i64s(&real)?;
                if ints.len() == 1 {
                    Value::Int(ints[0])
                } else {
                    Value::List(ints.into_iter().map(Value::Int).collect())
                }
            }
        }
        other => return Err(MatError::UnsupportedClass(other)),
    };
    Ok((name, value))
}

fn bools(flags: Vec<bool>) -> Value {
    if flags.len() == 1 {
        Value::Bool(flags[0])
    } else {
        Value::List(flags.into_iter().map(Value::Bool).collect())
    }
}

fn nested_matrix(cursor: &mut Cursor<'_>) -> MatResult<Value> {
    let element = cursor.next_element()?;
    if element.data_type != MI_MATRIX {
        return Err(MatError::UnsupportedElement(element.data_type));
    }
    Ok(parse_matrix(element.data)?.1)
}

fn parse_struct(cursor: &mut Cursor<'_>, dims: &[usize], count: usize) -> MatResult<Value> {
    let name_len_element = cursor.next_element()?;
    let name_len = as_i64s(&name_len_element)?
        .first()
        .copied()
        .and_then(|len| usize::try_from(len).ok())
        .filter(|len| *len > 0)
        .unwrap_or(1);

    let names_element = cursor.next_element()?;
    let fields: Vec<String> = names_element
        .data
        .chunks(name_len)
        .map(|chunk| {
            let end = chunk.iter().position(|b| *b == 0).unwrap_or(chunk.len());
            String::from_utf8_lossy(&chunk[..end]).into_owned()
        })
        .collect();

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let mut record = ValueMap::new();
        for field in &fields {
            record.insert(field.clone(), nested_matrix(cursor)?);
        }
        records.push(record);
    }

    if dims == [1, 1] {
        Ok(Value::Map(records.pop().unwrap_or_default()))
    } else {
        Ok(Value::List(records.into_iter().map(Value::Map).collect()))
    }
}

fn decode_text(element: &Element<'_>) -> MatResult<String> {
    match element.data_type {
        MI_UINT16 | MI_UTF16 | MI_INT16 => {
            let units: Vec<u16> = element
                .data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Ok(String::from_utf16_lossy(&units))
        }
        MI_UTF8 | MI_UINT8 | MI_INT8 => Ok(String::from_utf8_lossy(element.data).into_owned()),
        other => Err(MatError::UnsupportedElement(other)),
    }
}

fn as_u32s(element: &Element<'_>) -> MatResult<Vec<u32>> {
    Ok(as_i64s(element)?.into_iter().map(|v| v as u32).collect())
}

fn as_i64s(element: &Element<'_>) -> MatResult<Vec<i64>> {
    let data = element.data;
    let values = match element.data_type {
        MI_INT8 => data.iter().map(|b| i64::from(*b as i8)).collect(),
        MI_UINT8 => data.iter().map(|b| i64::from(*b)).collect(),
        MI_INT16 => fixed(data, |raw: [u8; 2]| i64::from(i16::from_le_bytes(raw))),
        MI_UINT16 => fixed(data, |raw: [u8; 2]| i64::from(u16::from_le_bytes(raw))),
        MI_INT32 => fixed(data, |raw: [u8; 4]| i64::from(i32::from_le_bytes(raw))),
        MI_UINT32 => fixed(data, |raw: [u8; 4]| i64::from(u32::from_le_bytes(raw))),
        MI_INT64 => fixed(data, i64::from_le_bytes),
        MI_UINT64 => fixed(data, |raw: [u8; 8]| u64::from_le_bytes(raw) as i64),
        MI_SINGLE => fixed(data, |raw: [u8; 4]| f32::from_le_bytes(raw) as i64),
        MI_DOUBLE => fixed(data, |raw: [u8; 8]| f64::from_le_bytes(raw) as i64),
        other => return Err(MatError::UnsupportedElement(other)),
    };
    Ok(values)
}

fn as_f64s(element: &Element<'_>) -> MatResult<Vec<f64>> {
    let data = element.data;
    let values = match element.data_type {
        MI_DOUBLE => fixed(data, f64::from_le_bytes),
        MI_SINGLE => fixed(data, |raw: [u8; 4]| f64::from(f32::from_le_bytes(raw))),
        MI_INT64 => fixed(data, |raw: [u8; 8]| i64::from_le_bytes(raw) as f64),
        MI_UINT64 => fixed(data, |raw: [u8; 8]| u64::from_le_bytes(raw) as f64),
        _ => as_i64s(element)?.into_iter().map(|v| v as f64).collect(),
    };
    Ok(values)
}

fn fixed<const N: usize, T>(data: &[u8], decode: impl Fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            decode(raw)
        })
        .collect()
}
