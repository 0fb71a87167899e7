//! Minidump header and crashpad annotation parsing
//!
//! Layout reference (all integers little-endian):
//!
//! ```text
//! offset  size  field
//! 0       4     signature "MDMP"
//! 4       4     version
//! 8       4     stream count
//! 12      4     stream directory rva
//! 16      4     checksum
//! 20      4     timestamp (seconds)
//! 24      8     flags
//! ```
//!
//! Directory entries are 12 bytes: `(stream_type, data_size, rva)`. The
//! crashpad info stream holds a module list; each module points at a table
//! of annotation objects `(name_rva: u32, type: u16, reserved: u16,
//! value_rva: u32)`. Type 1 annotations are strings stored as a `u32`
//! length followed by that many UTF-8 bytes.
//!
//! Every read is bounds-checked against the input. Past a valid header,
//! any inconsistency just means "no annotations".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::MinidumpError;

/// Leading magic bytes of every minidump
pub const SIGNATURE: &[u8; 4] = b"MDMP";

/// Smallest buffer that can hold a real dump
pub const MIN_DUMP_SIZE: usize = 10_000;

/// Stream type of the crashpad info stream
pub const CRASHPAD_INFO_STREAM: u32 = 0x4350_0001;

const HEADER_SIZE: usize = 32;
const DIRECTORY_ENTRY_SIZE: usize = 12;
/// `version(4) + report_id(16) + client_id(16) + simple_annotations(8)`
const MODULE_LIST_OFFSET: usize = 44;
/// `version(4) + list_annotations(8) + simple_annotations(8)`
const ANNOTATION_OBJECTS_OFFSET: usize = 20;
const ANNOTATION_TYPE_STRING: u16 = 1;

/// Fixed minidump header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinidumpHeader {
    pub signature: [u8; 4],
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub timestamp: DateTime<Utc>,
    pub flags: u64,
}

/// Flat `name -> value` map of crashpad string annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashpadAnnotations(BTreeMap<String, String>);

impl CrashpadAnnotations {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Process type recorded by the crashing process (e.g. `renderer`)
    pub fn process_type(&self) -> Option<&str> {
        self.get("process_type")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Result of [`parse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMinidump {
    pub header: MinidumpHeader,
    /// `None` when the dump has no crashpad stream or it could not be walked
    pub crashpad_annotations: Option<CrashpadAnnotations>,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    data_size: u32,
    rva: u32,
}

/// Bounds-checked little-endian reads
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        self.buf.get(offset..end)
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let b = self.bytes(offset, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let b = self.bytes(offset, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, offset: usize) -> Option<u64> {
        let b = self.bytes(offset, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Some(u64::from_le_bytes(arr))
    }

    fn location(&self, offset: usize) -> Option<Location> {
        Some(Location {
            data_size: self.u32(offset)?,
            rva: self.u32(offset.checked_add(4)?)?,
        })
    }

    fn sub(&self, loc: Location) -> Option<Reader<'a>> {
        self.bytes(loc.rva as usize, loc.data_size as usize)
            .map(Reader::new)
    }

    fn string(&self, rva: usize) -> Option<String> {
        let len = self.u32(rva)? as usize;
        let bytes = self.bytes(rva.checked_add(4)?, len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Parses the header and, when present, the crashpad annotations
pub fn parse(buf: &[u8]) -> Result<ParsedMinidump, MinidumpError> {
    if buf.len() < MIN_DUMP_SIZE {
        return Err(MinidumpError::TooSmall {
            len: buf.len(),
            min: MIN_DUMP_SIZE,
        });
    }

    let header = read_header(buf)?;
    let crashpad_annotations = read_crashpad_annotations(buf, &header);

    Ok(ParsedMinidump {
        header,
        crashpad_annotations,
    })
}

fn read_header(buf: &[u8]) -> Result<MinidumpHeader, MinidumpError> {
    let r = Reader::new(buf);
    let truncated = || MinidumpError::TooSmall {
        len: buf.len(),
        min: HEADER_SIZE,
    };

    let mut signature = [0u8; 4];
    signature.copy_from_slice(r.bytes(0, 4).ok_or_else(truncated)?);
    if &signature != SIGNATURE {
        return Err(MinidumpError::BadSignature(signature));
    }

    let seconds = r.u32(20).ok_or_else(truncated)?;
    Ok(MinidumpHeader {
        signature,
        version: r.u32(4).ok_or_else(truncated)?,
        stream_count: r.u32(8).ok_or_else(truncated)?,
        stream_directory_rva: r.u32(12).ok_or_else(truncated)?,
        checksum: r.u32(16).ok_or_else(truncated)?,
        timestamp: DateTime::from_timestamp(i64::from(seconds), 0).unwrap_or_default(),
        flags: r.u64(24).ok_or_else(truncated)?,
    })
}

fn read_crashpad_annotations(buf: &[u8], header: &MinidumpHeader) -> Option<CrashpadAnnotations> {
    let r = Reader::new(buf);
    let dir = header.stream_directory_rva as usize;

    for i in 0..header.stream_count as usize {
        let entry = dir.checked_add(i.checked_mul(DIRECTORY_ENTRY_SIZE)?)?;
        let stream_type = r.u32(entry)?;
        if stream_type == CRASHPAD_INFO_STREAM {
            let info = r.sub(r.location(entry + 4)?)?;
            let module_list = info.location(MODULE_LIST_OFFSET)?;
            return read_module_links(&r, module_list).map(CrashpadAnnotations);
        }
    }
    None
}

fn read_module_links(all: &Reader<'_>, loc: Location) -> Option<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    let links = all.sub(loc)?;
    if links.buf.is_empty() {
        return Some(annotations);
    }

    let count = links.u32(0)? as usize;
    let mut offset = 4usize;
    for _ in 0..count {
        // (module_list_index: u32, location: 8 bytes)
        let module_info = links.location(offset + 4)?;
        // later modules win on duplicate names
        annotations.extend(read_annotation_objects(all, module_info)?);
        offset += 12;
    }
    Some(annotations)
}

fn read_annotation_objects(all: &Reader<'_>, loc: Location) -> Option<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    let info = all.sub(loc)?;
    if info.buf.is_empty() {
        return Some(annotations);
    }

    let objects = all.sub(info.location(ANNOTATION_OBJECTS_OFFSET)?)?;
    let count = objects.u32(0)? as usize;
    let mut offset = 4usize;
    for _ in 0..count {
        let name_rva = objects.u32(offset)? as usize;
        let ty = objects.u16(offset + 4)?;
        let value_rva = objects.u32(offset + 8)? as usize;
        if ty == ANNOTATION_TYPE_STRING {
            annotations.insert(all.string(name_rva)?, all.string(value_rva)?);
        }
        offset += 12;
    }
    Some(annotations)
}
