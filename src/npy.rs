//! The NumPy `.npy` format for single dense matrices
//!
//! ```text
//! +----------------------+
//! | \x93NUMPY  (6B)      |
//! | major, minor (2B)    |
//! | header length (2/4B) |
//! | header dict (ASCII)  |
//! +----------------------+
//! | data                 |
//! +----------------------+
//! ```
//!
//! Matrices are written as little-endian `f64` in column-major (Fortran)
//! order so that a single column can be read with one seek.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::DMatrix;
use regex::Regex;

use crate::error::{CalcError, Result};

pub const MAGIC: [u8; 6] = [0x93, b'N', b'U', b'M', b'P', b'Y'];

/// Upper bound for the length of the header dict.
const MAX_HEADER_LEN: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F64,
    F32,
    I64,
    I32,
}

impl DType {
    fn parse(descr: &str) -> Result<Self> {
        match descr {
            "<f8" => Ok(DType::F64),
            "<f4" => Ok(DType::F32),
            "<i8" => Ok(DType::I64),
            "<i4" => Ok(DType::I32),
            other => Err(CalcError::MatrixFormat(format!("unsupported dtype {}", other))),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
        }
    }

    fn read<R: Read>(&self, r: &mut R) -> std::io::Result<f64> {
        Ok(match self {
            DType::F64 => r.read_f64::<LittleEndian>()?,
            DType::F32 => r.read_f32::<LittleEndian>()? as f64,
            DType::I64 => r.read_i64::<LittleEndian>()? as f64,
            DType::I32 => r.read_i32::<LittleEndian>()? as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub dtype: DType,
    pub fortran_order: bool,
    pub rows: usize,
    pub cols: usize,
    /// Offset of the first data byte.
    pub data_offset: u64,
}

impl Header {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(CalcError::MatrixFormat("not an npy file".to_string()));
        }
        let major = r.read_u8()?;
        let _minor = r.read_u8()?;
        let (len, prefix) = match major {
            1 => (r.read_u16::<LittleEndian>()? as usize, 10),
            2 | 3 => (r.read_u32::<LittleEndian>()? as usize, 12),
            v => return Err(CalcError::MatrixFormat(format!("unsupported npy version {}", v))),
        };
        if len > MAX_HEADER_LEN {
            return Err(CalcError::MatrixFormat(format!("header of {} bytes is too long", len)));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        let descr_re = Regex::new(r"'descr'\s*:\s*'([^']+)'")?;
        let order_re = Regex::new(r"'fortran_order'\s*:\s*(True|False)")?;
        let shape_re = Regex::new(r"'shape'\s*:\s*\(([^)]*)\)")?;

        let descr = descr_re
            .captures(&text)
            .ok_or_else(|| CalcError::MatrixFormat("missing descr".to_string()))?;
        let dtype = DType::parse(&descr[1])?;
        let fortran_order = order_re
            .captures(&text)
            .map(|c| &c[1] == "True")
            .ok_or_else(|| CalcError::MatrixFormat("missing fortran_order".to_string()))?;
        let shape = shape_re
            .captures(&text)
            .ok_or_else(|| CalcError::MatrixFormat("missing shape".to_string()))?;
        let dims: Vec<usize> = shape[1]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| CalcError::MatrixFormat(format!("invalid dimension {}", s)))
            })
            .collect::<Result<_>>()?;
        let (rows, cols) = match dims.as_slice() {
            [n] => (*n, 1),
            [rows, cols] => (*rows, *cols),
            _ => {
                return Err(CalcError::MatrixFormat(format!(
                    "expected a vector or matrix but got shape {:?}",
                    dims
                )));
            }
        };

        Ok(Self {
            dtype,
            fortran_order,
            rows,
            cols,
            data_offset: (prefix + len) as u64,
        })
    }

    /// Number of data bytes the shape calls for.
    pub fn data_len(&self) -> Result<u64> {
        (self.rows as u64)
            .checked_mul(self.cols as u64)
            .and_then(|n| n.checked_mul(self.dtype.size() as u64))
            .ok_or_else(|| {
                CalcError::MatrixFormat(format!("shape ({}, {}) is too large", self.rows, self.cols))
            })
    }

    /// Fails unless the stream holds all data bytes after `data_start`.
    fn check_data<R: Seek>(&self, r: &mut R, data_start: u64) -> Result<()> {
        let pos = r.stream_position()?;
        let end = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(pos))?;
        let needed = self.data_len()?;
        if data_start.checked_add(needed).is_none_or(|last| last > end) {
            return Err(CalcError::MatrixFormat(format!(
                "shape ({}, {}) needs {} data bytes but the file is shorter",
                self.rows, self.cols, needed
            )));
        }
        Ok(())
    }
}

/// Writes a matrix as `<f8` in Fortran order.
pub fn write_to<W: Write>(w: &mut W, matrix: &DMatrix<f64>) -> Result<()> {
    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': True, 'shape': ({}, {}), }}",
        matrix.nrows(),
        matrix.ncols()
    );
    // magic + version + length + dict + newline, padded to 64 bytes
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header = format!("{}{}\n", dict, " ".repeat(padding));

    w.write_all(&MAGIC)?;
    w.write_u8(1)?;
    w.write_u8(0)?;
    w.write_u16::<LittleEndian>(header.len() as u16)?;
    w.write_all(header.as_bytes())?;
    // nalgebra stores column-major
    for v in matrix.iter() {
        w.write_f64::<LittleEndian>(*v)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<DMatrix<f64>> {
    let start = r.stream_position()?;
    let header = Header::read(r)?;
    header.check_data(r, start + header.data_offset)?;
    let n = header.rows * header.cols;
    let mut data = Vec::with_capacity(n);
    for _ in 0..n {
        data.push(header.dtype.read(r)?);
    }
    Ok(if header.fortran_order {
        DMatrix::from_vec(header.rows, header.cols, data)
    } else {
        DMatrix::from_row_slice(header.rows, header.cols, &data)
    })
}

pub fn write(path: &Path, matrix: &DMatrix<f64>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_to(&mut w, matrix)
}

pub fn load(path: &Path) -> Result<DMatrix<f64>> {
    let mut r = BufReader::new(File::open(path)?);
    read_from(&mut r)
}

/// Reads one column without loading the whole matrix.
pub fn load_column(path: &Path, column: usize) -> Result<Vec<f64>> {
    let mut r = BufReader::new(File::open(path)?);
    read_column(&mut r, column)
}

/// Reads one column of the matrix stored at the start of `r`.
pub fn read_column<R: Read + Seek>(r: &mut R, column: usize) -> Result<Vec<f64>> {
    let start = r.stream_position()?;
    let header = Header::read(r)?;
    if column >= header.cols {
        return Err(CalcError::InvalidInput(format!(
            "column {} is out of range for a matrix with {} columns",
            column, header.cols
        )));
    }
    let data = start + header.data_offset;
    header.check_data(r, data)?;
    // offsets below stay within the checked data length
    let size = header.dtype.size() as u64;
    let (rows, cols, column) = (header.rows as u64, header.cols as u64, column as u64);
    let mut values = Vec::with_capacity(header.rows);
    if header.fortran_order {
        r.seek(SeekFrom::Start(data + column * rows * size))?;
        for _ in 0..header.rows {
            values.push(header.dtype.read(r)?);
        }
    } else {
        for row in 0..rows {
            r.seek(SeekFrom::Start(data + (row * cols + column) * size))?;
            values.push(header.dtype.read(r)?);
        }
    }
    Ok(values)
}
