//! MAT v5 writer.

use super::{
    MatError, MatResult, FLAG_LOGICAL, HEADER_TEXT_LEN, MAX_NAME_LEN, MI_COMPRESSED, MI_DOUBLE,
    MI_INT32, MI_INT64, MI_INT8, MI_MATRIX, MI_UINT16, MI_UINT32, MI_UINT8, MX_CELL, MX_CHAR,
    MX_DOUBLE, MX_INT64, MX_STRUCT, MX_UINT8, VERSION,
};
use crate::model::value::{Value, ValueMap};
use chrono::Local;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Codec options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Wrap every variable in a zlib `miCOMPRESSED` element.
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { compress: true }
    }
}

/// Writes `variables` to `path`, replacing any existing file.
pub fn write_mat(path: &Path, variables: &ValueMap, options: &WriteOptions) -> MatResult<()> {
    let started_at = Instant::now();
    let bytes = to_bytes(variables, options)?;
    fs::write(path, &bytes)?;
    info!(
        "event=mat_write module=mat status=ok variables={} bytes={} compressed={} duration_ms={}",
        variables.len(),
        bytes.len(),
        options.compress,
        started_at.elapsed().as_millis()
    );
    Ok(())
}

/// Encodes `variables` as a complete MAT-file image.
pub fn to_bytes(variables: &ValueMap, options: &WriteOptions) -> MatResult<Vec<u8>> {
    let mut out = header();
    for (name, value) in variables {
        let name = matlab_name(name);
        let element = matrix_element(&name, value)?;
        if options.compress {
            let compressed = compress(&element)?;
            push_tag(&mut out, MI_COMPRESSED, compressed.len(), &name)?;
            out.extend_from_slice(&compressed);
        } else {
            out.extend_from_slice(&element);
        }
        debug!("event=mat_write module=mat status=variable name={name}");
    }
    Ok(out)
}

/// Rewrites `name` into a MATLAB identifier.
///
/// Characters outside `[A-Za-z0-9_]` become `_`, names not starting with a
/// letter get an `x` prefix, and the result is cut to 63 characters.
pub fn matlab_name(name: &str) -> String {
    let mut valid: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !valid.starts_with(|c: char| c.is_ascii_alphabetic()) {
        valid.insert(0, 'x');
    }
    valid.truncate(MAX_NAME_LEN);
    valid
}

fn header() -> Vec<u8> {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created on: {}",
        std::env::consts::OS,
        Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    let mut out: Vec<u8> = text.into_bytes();
    out.resize(HEADER_TEXT_LEN, b' ');
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(b"IM");
    out
}

fn compress(element: &[u8]) -> MatResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(element)?;
    Ok(encoder.finish()?)
}

fn push_tag(out: &mut Vec<u8>, data_type: u32, len: usize, name: &str) -> MatResult<()> {
    let len = u32::try_from(len).map_err(|_| MatError::TooLarge {
        name: name.to_string(),
    })?;
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Appends one data element, using the packed small form for 1..=4 bytes.
fn push_element(out: &mut Vec<u8>, data_type: u32, data: &[u8]) {
    if (1..=4).contains(&data.len()) {
        let packed = ((data.len() as u32) << 16) | data_type;
        out.extend_from_slice(&packed.to_le_bytes());
        out.extend_from_slice(data);
        out.resize(out.len() + 4 - data.len(), 0);
        return;
    }
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    let padding = (8 - data.len() % 8) % 8;
    out.resize(out.len() + padding, 0);
}

/// Encodes one complete `miMATRIX` element.
fn matrix_element(name: &str, value: &Value) -> MatResult<Vec<u8>> {
    let mut body = Vec::new();
    match value {
        Value::Null | Value::Empty => list_body(&mut body, &[], name)?,
        Value::Bool(flag) => {
            logical_body(&mut body, &[*flag], name);
        }
        Value::Int(int) => {
            numeric_header(&mut body, MX_INT64, 0, [1, 1], name);
            push_element(&mut body, MI_INT64, &int.to_le_bytes());
        }
        Value::Float(float) => double_body(&mut body, &[*float], name),
        Value::Text(text) => char_body(&mut body, text, name),
        Value::Timestamp(_) | Value::Opaque { .. } => char_body(&mut body, &value.to_text(), name),
        Value::Bytes(bytes) => {
            numeric_header(&mut body, MX_UINT8, 0, row_dims(bytes.len()), name);
            push_element(&mut body, MI_UINT8, bytes);
        }
        Value::Array(samples) => double_body(&mut body, samples, name),
        Value::Map(map) => struct_body(&mut body, &[map], [1, 1], name)?,
        Value::List(items) => list_body(&mut body, items, name)?,
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    push_tag(&mut out, MI_MATRIX, body.len(), name)?;
    out.extend_from_slice(&body);
    Ok(out)
}

fn row_dims(len: usize) -> [usize; 2] {
    if len == 0 {
        [0, 0]
    } else {
        [1, len]
    }
}

fn numeric_header(body: &mut Vec<u8>, class: u8, flags: u32, dims: [usize; 2], name: &str) {
    let mut array_flags = Vec::with_capacity(8);
    array_flags.extend_from_slice(&(u32::from(class) | flags).to_le_bytes());
    array_flags.extend_from_slice(&0u32.to_le_bytes());
    push_element(body, MI_UINT32, &array_flags);

    let mut dimensions = Vec::with_capacity(8);
    for dim in dims {
        dimensions.extend_from_slice(&(dim as i32).to_le_bytes());
    }
    push_element(body, MI_INT32, &dimensions);
    push_element(body, MI_INT8, name.as_bytes());
}

fn double_body(body: &mut Vec<u8>, samples: &[f64], name: &str) {
    numeric_header(body, MX_DOUBLE, 0, row_dims(samples.len()), name);
    let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    push_element(body, MI_DOUBLE, &data);
}

fn int64_body(body: &mut Vec<u8>, ints: &[i64], name: &str) {
    numeric_header(body, MX_INT64, 0, row_dims(ints.len()), name);
    let data: Vec<u8> = ints.iter().flat_map(|i| i.to_le_bytes()).collect();
    push_element(body, MI_INT64, &data);
}

fn logical_body(body: &mut Vec<u8>, flags: &[bool], name: &str) {
    numeric_header(body, MX_UINT8, FLAG_LOGICAL, row_dims(flags.len()), name);
    let data: Vec<u8> = flags.iter().map(|flag| u8::from(*flag)).collect();
    push_element(body, MI_UINT8, &data);
}

fn char_body(body: &mut Vec<u8>, text: &str, name: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    numeric_header(body, MX_CHAR, 0, row_dims(units.len()), name);
    let data: Vec<u8> = units.iter().flat_map(|unit| unit.to_le_bytes()).collect();
    push_element(body, MI_UINT16, &data);
}

fn list_body(body: &mut Vec<u8>, items: &[Value], name: &str) -> MatResult<()> {
    if items.is_empty() {
        numeric_header(body, MX_DOUBLE, 0, [0, 0], name);
        push_element(body, MI_DOUBLE, &[]);
        return Ok(());
    }

    if let Some(ints) = items.iter().map(int_of).collect::<Option<Vec<i64>>>() {
        int64_body(body, &ints, name);
    } else if let Some(floats) = items.iter().map(float_of).collect::<Option<Vec<f64>>>() {
        double_body(body, &floats, name);
    } else if let Some(flags) = items.iter().map(bool_of).collect::<Option<Vec<bool>>>() {
        logical_body(body, &flags, name);
    } else if let Some(records) = items.iter().map(Value::as_map).collect::<Option<Vec<_>>>() {
        struct_body(body, &records, [1, records.len()], name)?;
    } else {
        numeric_header(body, MX_CELL, 0, [1, items.len()], name);
        for item in items {
            body.extend_from_slice(&matrix_element("", item)?);
        }
    }
    Ok(())
}

fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(int) => Some(*int),
        _ => None,
    }
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::Int(int) => Some(*int as f64),
        Value::Float(float) => Some(*float),
        _ => None,
    }
}

fn bool_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        _ => None,
    }
}

/// Writes a struct array whose fields are the union of all record keys.
fn struct_body(
    body: &mut Vec<u8>,
    records: &[&ValueMap],
    dims: [usize; 2],
    name: &str,
) -> MatResult<()> {
    let keys: BTreeSet<&String> = records
        .iter()
        .copied()
        .flat_map(|record| record.keys())
        .collect();
    let fields = unique_field_names(&keys);

    numeric_header(body, MX_STRUCT, 0, dims, name);
    let name_len = fields
        .iter()
        .map(|(_, field)| field.len() + 1)
        .max()
        .unwrap_or(1);
    push_element(body, MI_INT32, &(name_len as i32).to_le_bytes());

    let mut names = Vec::with_capacity(name_len * fields.len());
    for (_, field) in &fields {
        let start = names.len();
        names.extend_from_slice(field.as_bytes());
        names.resize(start + name_len, 0);
    }
    push_element(body, MI_INT8, &names);

    let missing = Value::Null;
    for record in records {
        for (key, _) in &fields {
            let value = record.get(key.as_str()).unwrap_or(&missing);
            body.extend_from_slice(&matrix_element("", value)?);
        }
    }
    Ok(())
}

/// Pairs each source key with a distinct MATLAB field name.
fn unique_field_names<'k>(keys: &BTreeSet<&'k String>) -> Vec<(&'k String, String)> {
    let mut taken = BTreeSet::new();
    keys.iter()
        .map(|key| {
            let base = matlab_name(key);
            let mut candidate = base.clone();
            let mut suffix = 1;
            while !taken.insert(candidate.clone()) {
                let tail = format!("_{suffix}");
                let keep = MAX_NAME_LEN.saturating_sub(tail.len()).min(base.len());
                candidate = format!("{}{}", &base[..keep], tail);
                suffix += 1;
            }
            if candidate != **key {
                debug!(
                    "event=mat_write module=mat status=renamed from={} to={}",
                    key, candidate
                );
            }
            (*key, candidate)
        })
        .collect()
}
