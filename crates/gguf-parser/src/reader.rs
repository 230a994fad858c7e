//! Streaming reader over the GGUF metadata section.
//!
//! Values are decoded only when asked for.  Everything else is skipped,
//! so looking up `general.name` does not materialise a 150k-entry
//! tokenizer vocabulary.

use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::types::*;

/// Largest string we are willing to allocate for (chat templates can run
/// to tens of KiB; nothing legitimate comes close to this).
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

const MAX_ARRAY_LEN: u64 = 64 * 1024 * 1024;

/// Arrays of arrays are legal but real files nest at most two levels.
const MAX_ARRAY_DEPTH: u32 = 8;

/// Reads a GGUF header and then its metadata KVs one by one.
pub struct GgufReader<R> {
    inner: R,
    header: GGUFHeader,
    remaining: u64,
}

impl GgufReader<BufReader<fs::File>> {
    pub fn open(path: &Path) -> Result<Self, GGUFError> {
        let file = fs::File::open(path)?;
        let reader = Self::new(BufReader::new(file))?;
        debug!(
            path = %path.display(),
            version = reader.header.version,
            kv_count = reader.header.metadata_kv_count,
            "GGUF header read"
        );
        Ok(reader)
    }
}

impl<R: Read> GgufReader<R> {
    /// Parse the header from `inner`.
    pub fn new(mut inner: R) -> Result<Self, GGUFError> {
        let magic = read_u32(&mut inner).map_err(|_| GGUFError::TruncatedHeader)?;
        if magic != GGUF_MAGIC {
            return Err(GGUFError::InvalidMagic(magic));
        }

        // Version 1 used 32-bit counts and lengths; it is long obsolete.
        let version = read_u32(&mut inner).map_err(|_| GGUFError::TruncatedHeader)?;
        if !(2..=GGUF_VERSION_MAX).contains(&version) {
            return Err(GGUFError::UnsupportedVersion(version));
        }

        let tensor_count = read_u64(&mut inner).map_err(|_| GGUFError::TruncatedHeader)?;
        let metadata_kv_count = read_u64(&mut inner).map_err(|_| GGUFError::TruncatedHeader)?;

        Ok(Self {
            inner,
            header: GGUFHeader {
                version,
                tensor_count,
                metadata_kv_count,
            },
            remaining: metadata_kv_count,
        })
    }

    pub fn header(&self) -> &GGUFHeader {
        &self.header
    }

    /// Decode the next KV, or `None` once the metadata section is done.
    pub fn next_kv(&mut self) -> Result<Option<GGUFMetadataKV>, GGUFError> {
        let Some((key, vtype)) = self.next_key()? else {
            return Ok(None);
        };
        let value = read_value(&mut self.inner, vtype, 0)?;
        Ok(Some(GGUFMetadataKV { key, value }))
    }

    /// Scan forward for `key`, skipping every other value.
    pub fn find(&mut self, key: &str) -> Result<Option<GGUFValue>, GGUFError> {
        while let Some((k, vtype)) = self.next_key()? {
            if k == key {
                return read_value(&mut self.inner, vtype, 0).map(Some);
            }
            skip_value(&mut self.inner, vtype, 0)?;
        }
        Ok(None)
    }

    fn next_key(&mut self) -> Result<Option<(String, GGUFValueType)>, GGUFError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let key = read_string(&mut self.inner)?;
        let vtype = GGUFValueType::try_from(read_u32(&mut self.inner)?)?;
        Ok(Some((key, vtype)))
    }
}

impl<R: Read> Iterator for GgufReader<R> {
    type Item = Result<GGUFMetadataKV, GGUFError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_kv() {
            Ok(kv) => kv.map(Ok),
            Err(e) => {
                // Positions are unknown after an error; stop iterating.
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

//  Convenience lookups

/// Read one metadata value from `path` without loading the model,
/// rendered as text.  `Ok(None)` if the key is absent.
pub fn read_gguf_meta(path: &Path, key: &str) -> Result<Option<String>, GGUFError> {
    let value = GgufReader::open(path)?.find(key)?;
    Ok(value.map(|v| v.to_string()))
}

/// `general.name` of the model at `path`.
pub fn model_name(path: &Path) -> Result<Option<String>, GGUFError> {
    read_gguf_meta(path, "general.name")
}

/// Header plus every metadata KV of `path`.
pub fn read_metadata(path: &Path) -> Result<(GGUFHeader, Vec<GGUFMetadataKV>), GGUFError> {
    let mut reader = GgufReader::open(path)?;
    let header = reader.header().clone();
    let kvs = reader.by_ref().collect::<Result<Vec<_>, _>>()?;
    Ok((header, kvs))
}

//  Binary reading primitives

fn read_array<const N: usize>(r: &mut impl Read) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    read_array(r).map(u32::from_le_bytes)
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    read_array(r).map(u64::from_le_bytes)
}

fn read_len(r: &mut impl Read, max: u64, what: &str) -> Result<u64, GGUFError> {
    let len = read_u64(r)?;
    if len > max {
        return Err(GGUFError::Other(format!("{what} length {len} too large")));
    }
    Ok(len)
}

fn read_string(r: &mut impl Read) -> Result<String, GGUFError> {
    let len = read_len(r, MAX_STRING_LEN, "string")?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn check_depth(depth: u32) -> Result<(), GGUFError> {
    if depth >= MAX_ARRAY_DEPTH {
        return Err(GGUFError::Other(format!(
            "arrays nested deeper than {MAX_ARRAY_DEPTH} levels"
        )));
    }
    Ok(())
}

fn read_value(
    r: &mut impl Read,
    vtype: GGUFValueType,
    depth: u32,
) -> Result<GGUFValue, GGUFError> {
    Ok(match vtype {
        GGUFValueType::Uint8 => GGUFValue::Uint8(u8::from_le_bytes(read_array(r)?)),
        GGUFValueType::Int8 => GGUFValue::Int8(i8::from_le_bytes(read_array(r)?)),
        GGUFValueType::Uint16 => GGUFValue::Uint16(u16::from_le_bytes(read_array(r)?)),
        GGUFValueType::Int16 => GGUFValue::Int16(i16::from_le_bytes(read_array(r)?)),
        GGUFValueType::Uint32 => GGUFValue::Uint32(read_u32(r)?),
        GGUFValueType::Int32 => GGUFValue::Int32(i32::from_le_bytes(read_array(r)?)),
        GGUFValueType::Float32 => GGUFValue::Float32(f32::from_le_bytes(read_array(r)?)),
        GGUFValueType::Bool => GGUFValue::Bool(read_array::<1>(r)?[0] != 0),
        GGUFValueType::String => GGUFValue::String(read_string(r)?),
        GGUFValueType::Uint64 => GGUFValue::Uint64(read_u64(r)?),
        GGUFValueType::Int64 => GGUFValue::Int64(i64::from_le_bytes(read_array(r)?)),
        GGUFValueType::Float64 => GGUFValue::Float64(f64::from_le_bytes(read_array(r)?)),
        GGUFValueType::Array => {
            check_depth(depth)?;
            let elem_type = GGUFValueType::try_from(read_u32(r)?)?;
            let count = read_len(r, MAX_ARRAY_LEN, "array")?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_value(r, elem_type, depth + 1)?);
            }
            GGUFValue::Array(items)
        }
    })
}

fn skip_value(r: &mut impl Read, vtype: GGUFValueType, depth: u32) -> Result<(), GGUFError> {
    match vtype {
        GGUFValueType::String => {
            let len = read_u64(r)?;
            skip_bytes(r, len)
        }
        GGUFValueType::Array => {
            check_depth(depth)?;
            let elem_type = GGUFValueType::try_from(read_u32(r)?)?;
            let count = read_len(r, MAX_ARRAY_LEN, "array")?;
            match elem_type.fixed_size() {
                Some(size) => skip_bytes(r, count * size),
                None => (0..count).try_for_each(|_| skip_value(r, elem_type, depth + 1)),
            }
        }
        scalar => skip_bytes(r, scalar.fixed_size().unwrap_or(0)),
    }
}

fn skip_bytes(r: &mut impl Read, n: u64) -> Result<(), GGUFError> {
    let copied = io::copy(&mut r.take(n), &mut io::sink())?;
    if copied < n {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}
