/* Copyright (C) 2024 Philipp Benner
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use byteordered::Endianness;
use flate2::write::ZlibEncoder;

use crate::error::{BigFileError, Result};
use crate::rom_buffer::Compression;

/* -------------------------------------------------------------------------- */

// Byte-order-aware sequential writer. Data blocks are buffered through
// an in-memory sub-stream and compressed on block exit.
pub struct OrderedDataOutput<W: Write + Seek> {
    writer: W,
    order : Endianness,
}

/* -------------------------------------------------------------------------- */

impl OrderedDataOutput<BufWriter<File>> {
    pub fn create(path: &Path, order: Endianness) -> Result<Self> {
        let file = File::create(path)?;
        Ok(OrderedDataOutput::new(BufWriter::new(file), order))
    }
}

/* -------------------------------------------------------------------------- */

impl<W: Write + Seek> OrderedDataOutput<W> {

    pub fn new(writer: W, order: Endianness) -> Self {
        OrderedDataOutput {
            writer: writer,
            order : order,
        }
    }

    pub fn order(&self) -> Endianness {
        self.order
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.writer.seek(SeekFrom::Current(0))?)
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.writer.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        match self.order {
            Endianness::Big    => self.writer.write_u16::<BigEndian>(value)?,
            Endianness::Little => self.writer.write_u16::<LittleEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_u16(value as u16)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        match self.order {
            Endianness::Big    => self.writer.write_u32::<BigEndian>(value)?,
            Endianness::Little => self.writer.write_u32::<LittleEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_u32(value as u32)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        match self.order {
            Endianness::Big    => self.writer.write_u64::<BigEndian>(value)?,
            Endianness::Little => self.writer.write_u64::<LittleEndian>(value)?,
        }
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_u32(value.to_bits())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    pub fn write_cstring(&mut self, value: &str) -> Result<()> {
        self.writer.write_all(value.as_bytes())?;
        self.writer.write_u8(0)?;
        Ok(())
    }

    // Seek forward by writing zeros, so reserved regions have defined
    // content before they are backpatched
    pub fn skip_bytes(&mut self, n: usize) -> Result<()> {
        const ZEROS: [u8; 256] = [0u8; 256];
        let mut left = n;
        while left > 0 {
            let k = left.min(ZEROS.len());
            self.writer.write_all(&ZEROS[..k])?;
            left -= k;
        }
        Ok(())
    }

    // Scoped compressed sub-stream; returns the uncompressed size so the
    // caller can maintain the per-file maximum
    pub fn with_block<F>(&mut self, compression: Compression, f: F) -> Result<u64>
    where
        F: FnOnce(&mut OrderedDataOutput<Cursor<Vec<u8>>>) -> Result<()>,
    {
        let mut block = OrderedDataOutput::new(Cursor::new(Vec::new()), self.order);
        f(&mut block)?;
        let data       = block.into_writer().into_inner();
        let compressed = compress(&data, compression)?;
        self.writer.write_all(&compressed)?;
        Ok(data.len() as u64)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */

fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Snappy => {
            snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|_| BigFileError::Format("snappy block"))
        }
    }
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */
