//! `.npz` archives: zip files holding one `.npy` entry per named matrix
//!
//! Only the parts of the zip format that NumPy produces are read: stored
//! (method 0) and deflated (method 8) entries, with sizes taken from the
//! central directory and the zip64 extra field when they overflow.

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Crc;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use nalgebra::DMatrix;

use crate::error::{CalcError, Result};
use crate::npy;

const LOCAL_HEADER: u32 = 0x0403_4b50;
const CENTRAL_HEADER: u32 = 0x0201_4b50;
const END_OF_DIRECTORY: u32 = 0x0605_4b50;
const ZIP64_EXTRA: u16 = 0x0001;

const STORED: u16 = 0;
const DEFLATED: u16 = 8;

/// 1980-01-01
const DOS_DATE: u16 = 0x21;

/// Deflate cannot expand data by more than about 1032:1.
const MAX_DEFLATE_RATIO: u64 = 1032;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    method: u16,
    crc: u32,
    compressed_size: u64,
    size: u64,
    header_offset: u64,
}

/// An archive read fully into memory.
pub struct Archive {
    bytes: Vec<u8>,
    entries: Vec<Entry>,
}

fn format_error(msg: impl Into<String>) -> CalcError {
    CalcError::MatrixFormat(msg.into())
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let eocd = find_end_of_directory(&bytes)?;
        let mut r = Cursor::new(&bytes[eocd + 4..]);
        let _disk = r.read_u16::<LittleEndian>()?;
        let _directory_disk = r.read_u16::<LittleEndian>()?;
        let _disk_entries = r.read_u16::<LittleEndian>()?;
        let count = r.read_u16::<LittleEndian>()? as usize;
        let _directory_size = r.read_u32::<LittleEndian>()?;
        let directory_offset = r.read_u32::<LittleEndian>()? as usize;
        if directory_offset > bytes.len() {
            return Err(format_error("central directory lies outside the archive"));
        }

        let mut r = Cursor::new(&bytes[directory_offset..]);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(read_central_entry(&mut r)?);
        }
        Ok(Self { bytes, entries })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Matrix stored under `name`, with or without the `.npy` suffix.
    pub fn matrix(&self, name: &str) -> Result<Option<DMatrix<f64>>> {
        let Some(entry) = self.find(name) else {
            return Ok(None);
        };
        let data = self.entry_data(entry)?;
        Ok(Some(npy::read_from(&mut Cursor::new(data))?))
    }

    pub fn column(&self, name: &str, column: usize) -> Result<Option<Vec<f64>>> {
        let Some(entry) = self.find(name) else {
            return Ok(None);
        };
        let data = self.entry_data(entry)?;
        Ok(Some(npy::read_column(&mut Cursor::new(data), column)?))
    }

    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.name == name || e.name.strip_suffix(".npy") == Some(name))
    }

    fn entry_data(&self, entry: &Entry) -> Result<Vec<u8>> {
        let truncated = || format_error(format!("entry {} is truncated", entry.name));
        let start = usize::try_from(entry.header_offset).map_err(|_| truncated())?;
        let mut r = Cursor::new(self.bytes.get(start..).unwrap_or_default());
        if r.read_u32::<LittleEndian>()? != LOCAL_HEADER {
            return Err(format_error(format!("bad local header for {}", entry.name)));
        }
        // version, flags, method, time, date, crc, sizes
        r.set_position(26);
        let name_len = r.read_u16::<LittleEndian>()? as usize;
        let extra_len = r.read_u16::<LittleEndian>()? as usize;
        let data_start = start + 30 + name_len + extra_len;
        let data_end = usize::try_from(entry.compressed_size)
            .ok()
            .and_then(|len| data_start.checked_add(len))
            .ok_or_else(truncated)?;
        let raw = self.bytes.get(data_start..data_end).ok_or_else(truncated)?;

        let data = match entry.method {
            STORED => raw.to_vec(),
            DEFLATED => {
                let bound = (raw.len() as u64).saturating_mul(MAX_DEFLATE_RATIO);
                let mut out = Vec::with_capacity(entry.size.min(bound) as usize);
                // one byte past the declared size is enough to detect a mismatch
                DeflateDecoder::new(raw)
                    .take(entry.size.saturating_add(1))
                    .read_to_end(&mut out)?;
                out
            }
            m => return Err(format_error(format!("unsupported compression method {}", m))),
        };

        let mut crc = Crc::new();
        crc.update(&data);
        if crc.sum() != entry.crc || data.len() as u64 != entry.size {
            return Err(format_error(format!("checksum mismatch in {}", entry.name)));
        }
        Ok(data)
    }
}

fn find_end_of_directory(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 22 {
        return Err(format_error("file is too short for a zip archive"));
    }
    // the record is followed by a comment of at most 64 KiB
    let lowest = bytes.len().saturating_sub(22 + u16::MAX as usize);
    (lowest..=bytes.len() - 22)
        .rev()
        .find(|&i| bytes[i..i + 4] == END_OF_DIRECTORY.to_le_bytes())
        .ok_or_else(|| format_error("no end of central directory record"))
}

fn read_central_entry(r: &mut Cursor<&[u8]>) -> Result<Entry> {
    if r.read_u32::<LittleEndian>()? != CENTRAL_HEADER {
        return Err(format_error("bad central directory entry"));
    }
    let _made_by = r.read_u16::<LittleEndian>()?;
    let _needed = r.read_u16::<LittleEndian>()?;
    let _flags = r.read_u16::<LittleEndian>()?;
    let method = r.read_u16::<LittleEndian>()?;
    let _time = r.read_u16::<LittleEndian>()?;
    let _date = r.read_u16::<LittleEndian>()?;
    let crc = r.read_u32::<LittleEndian>()?;
    let mut compressed_size = r.read_u32::<LittleEndian>()? as u64;
    let mut size = r.read_u32::<LittleEndian>()? as u64;
    let name_len = r.read_u16::<LittleEndian>()? as usize;
    let extra_len = r.read_u16::<LittleEndian>()? as usize;
    let comment_len = r.read_u16::<LittleEndian>()? as usize;
    let _disk = r.read_u16::<LittleEndian>()?;
    let _internal = r.read_u16::<LittleEndian>()?;
    let _external = r.read_u32::<LittleEndian>()?;
    let mut header_offset = r.read_u32::<LittleEndian>()? as u64;

    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name)?;
    let mut extra = vec![0u8; extra_len];
    r.read_exact(&mut extra)?;
    r.set_position(r.position() + comment_len as u64);

    // zip64 values appear in this order, only for fields that overflowed
    let mut x = Cursor::new(extra.as_slice());
    while (x.position() as usize) + 4 <= extra.len() {
        let id = x.read_u16::<LittleEndian>()?;
        let len = x.read_u16::<LittleEndian>()? as u64;
        let end = x.position() + len;
        if id == ZIP64_EXTRA {
            if size == u32::MAX as u64 {
                size = x.read_u64::<LittleEndian>()?;
            }
            if compressed_size == u32::MAX as u64 {
                compressed_size = x.read_u64::<LittleEndian>()?;
            }
            if header_offset == u32::MAX as u64 {
                header_offset = x.read_u64::<LittleEndian>()?;
            }
        }
        x.set_position(end);
    }

    Ok(Entry {
        name: String::from_utf8_lossy(&name).into_owned(),
        method,
        crc,
        compressed_size,
        size,
        header_offset,
    })
}

pub fn load(path: &Path, name: &str) -> Result<Option<DMatrix<f64>>> {
    Archive::open(path)?.matrix(name)
}

pub fn load_column(path: &Path, name: &str, column: usize) -> Result<Option<Vec<f64>>> {
    Archive::open(path)?.column(name, column)
}

/// Writes each matrix as a deflated `<name>.npy` entry.
pub fn write(path: &Path, matrices: &[(&str, &DMatrix<f64>)]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_to(&mut w, matrices)
}

pub fn write_to<W: Write>(w: &mut W, matrices: &[(&str, &DMatrix<f64>)]) -> Result<()> {
    let mut offset: u64 = 0;
    let mut directory = Vec::new();

    for (name, matrix) in matrices {
        let mut data = Vec::new();
        npy::write_to(&mut data, matrix)?;
        let mut crc = Crc::new();
        crc.update(&data);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;
        let entry = Entry {
            name: format!("{}.npy", name),
            method: DEFLATED,
            crc: crc.sum(),
            compressed_size: compressed.len() as u64,
            size: data.len() as u64,
            header_offset: offset,
        };
        if entry.size > u32::MAX as u64 || offset > u32::MAX as u64 {
            return Err(CalcError::InvalidInput(format!(
                "matrix {} is too large for a zip archive",
                name
            )));
        }

        w.write_u32::<LittleEndian>(LOCAL_HEADER)?;
        write_common(w, &entry)?;
        w.write_u16::<LittleEndian>(0)?; // extra
        w.write_all(entry.name.as_bytes())?;
        w.write_all(&compressed)?;
        offset += 30 + entry.name.len() as u64 + entry.compressed_size;
        directory.push(entry);
    }

    let directory_offset = offset;
    let mut directory_size = 0u64;
    for entry in &directory {
        w.write_u32::<LittleEndian>(CENTRAL_HEADER)?;
        w.write_u16::<LittleEndian>(20)?; // made by
        write_common(w, entry)?;
        w.write_u16::<LittleEndian>(0)?; // extra
        w.write_u16::<LittleEndian>(0)?; // comment
        w.write_u16::<LittleEndian>(0)?; // disk
        w.write_u16::<LittleEndian>(0)?; // internal attributes
        w.write_u32::<LittleEndian>(0)?; // external attributes
        w.write_u32::<LittleEndian>(entry.header_offset as u32)?;
        w.write_all(entry.name.as_bytes())?;
        directory_size += 46 + entry.name.len() as u64;
    }

    w.write_u32::<LittleEndian>(END_OF_DIRECTORY)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(directory.len() as u16)?;
    w.write_u16::<LittleEndian>(directory.len() as u16)?;
    w.write_u32::<LittleEndian>(directory_size as u32)?;
    w.write_u32::<LittleEndian>(directory_offset as u32)?;
    w.write_u16::<LittleEndian>(0)?;
    w.flush()?;
    Ok(())
}

/// Fields shared by local and central headers, up to the name length.
fn write_common<W: Write>(w: &mut W, entry: &Entry) -> Result<()> {
    w.write_u16::<LittleEndian>(20)?; // version needed
    w.write_u16::<LittleEndian>(0)?; // flags
    w.write_u16::<LittleEndian>(entry.method)?;
    w.write_u16::<LittleEndian>(0)?; // time
    w.write_u16::<LittleEndian>(DOS_DATE)?;
    w.write_u32::<LittleEndian>(entry.crc)?;
    w.write_u32::<LittleEndian>(entry.compressed_size as u32)?;
    w.write_u32::<LittleEndian>(entry.size as u32)?;
    w.write_u16::<LittleEndian>(entry.name.len() as u16)?;
    Ok(())
}
