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

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use byteordered::Endianness;
use flate2::read::ZlibDecoder;
use memmap2::Mmap;

use crate::error::{BigFileError, Result};

/* -------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
    Snappy,
}

/* -------------------------------------------------------------------------- */

// Backing storage of a RomBuffer. Duplicates share the same bytes; the
// mapped variant keeps the map alive for as long as any view exists.
#[derive(Clone, Debug)]
enum RomData {
    Heap  (Arc<[u8]>),
    Mapped(Arc<Mmap>, usize, usize),
}

impl RomData {
    fn bytes(&self) -> &[u8] {
        match self {
            RomData::Heap  (data)                 => data,
            RomData::Mapped(map, offset, length)  => &map[*offset..*offset + *length],
        }
    }
}

/* -------------------------------------------------------------------------- */

// Read-only view over a file region with a cursor and a fixed byte order
#[derive(Debug)]
pub struct RomBuffer {
    data    : RomData,
    order   : Endianness,
    position: usize,
}

/* -------------------------------------------------------------------------- */

impl RomBuffer {

    pub fn from_vec(data: Vec<u8>, order: Endianness) -> Self {
        RomBuffer {
            data    : RomData::Heap(data.into()),
            order   : order,
            position: 0,
        }
    }

    pub(crate) fn from_mmap(map: Arc<Mmap>, offset: usize, length: usize, order: Endianness) -> Self {
        RomBuffer {
            data    : RomData::Mapped(map, offset, length),
            order   : order,
            position: 0,
        }
    }

    pub fn order(&self) -> Endianness {
        self.order
    }

    pub fn len(&self) -> usize {
        self.data.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position)
    }

    // Independent cursor over the same backing bytes
    pub fn duplicate(&self) -> RomBuffer {
        RomBuffer {
            data    : self.data.clone(),
            order   : self.order,
            position: self.position,
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        self.data.bytes()
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let start = self.position;
        let end   = start.checked_add(n).ok_or(BigFileError::Truncated)?;
        if end > self.data.bytes().len() {
            return Err(BigFileError::Truncated);
        }
        self.position = end;
        Ok(&self.data.bytes()[start..end])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let order = self.order;
        let buf   = self.take(2)?;
        Ok(match order {
            Endianness::Big    => BigEndian   ::read_u16(buf),
            Endianness::Little => LittleEndian::read_u16(buf),
        })
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let order = self.order;
        let buf   = self.take(4)?;
        Ok(match order {
            Endianness::Big    => BigEndian   ::read_u32(buf),
            Endianness::Little => LittleEndian::read_u32(buf),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let order = self.order;
        let buf   = self.take(8)?;
        Ok(match order {
            Endianness::Big    => BigEndian   ::read_u64(buf),
            Endianness::Little => LittleEndian::read_u64(buf),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    // Null-terminated string; the terminator is consumed but not returned
    pub fn get_cstring(&mut self) -> Result<String> {
        let bytes = self.data.bytes();
        let start = self.position;
        let end   = bytes
            .get(start..)
            .and_then(|tail| tail.iter().position(|&b| b == 0))
            .map(|i| start + i)
            .ok_or(BigFileError::Truncated)?;
        self.position = end + 1;
        Ok(String::from_utf8_lossy(&bytes[start..end]).into_owned())
    }

    pub fn get_i32s(&mut self, n: usize) -> Result<Vec<i32>> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.get_i32()?);
        }
        Ok(values)
    }

    pub fn get_f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.get_f32()?);
        }
        Ok(values)
    }

}

/* -------------------------------------------------------------------------- */

pub(crate) fn inflate(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate => {
            let mut decoder = ZlibDecoder::new(data);
            let mut buffer  = Vec::new();
            decoder.read_to_end(&mut buffer)?;
            Ok(buffer)
        }
        Compression::Snappy => {
            snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|_| BigFileError::Format("snappy block"))
        }
    }
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use byteordered::Endianness;

    use super::{inflate, Compression, RomBuffer};
    use crate::error::BigFileError;

    #[test]
    fn test_rom_buffer_orders() {

        let data = vec![0x12, 0x34, 0x56, 0x78];

        let mut big = RomBuffer::from_vec(data.clone(), Endianness::Big);
        assert_eq!(big.get_u32().unwrap(), 0x12345678);

        let mut little = RomBuffer::from_vec(data, Endianness::Little);
        assert_eq!(little.get_u32().unwrap(), 0x78563412);
    }

    #[test]
    fn test_rom_buffer_truncated() {

        let mut buffer = RomBuffer::from_vec(vec![1, 2, 3], Endianness::Little);

        assert!(matches!(buffer.get_u32(), Err(BigFileError::Truncated)));
        // a failed read does not advance the cursor
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.get_u16().unwrap(), 0x0201);
    }

    #[test]
    fn test_rom_buffer_cstring() {

        let mut buffer = RomBuffer::from_vec(b"chr1\0rest".to_vec(), Endianness::Little);

        assert_eq!(buffer.get_cstring().unwrap(), "chr1");
        assert_eq!(buffer.position(), 5);
        assert!(matches!(buffer.get_cstring(), Err(BigFileError::Truncated)));
    }

    #[test]
    fn test_rom_buffer_duplicate() {

        let mut a = RomBuffer::from_vec(vec![1, 0, 2, 0], Endianness::Little);

        assert_eq!(a.get_u16().unwrap(), 1);

        let mut b = a.duplicate();

        assert_eq!(a.get_u16().unwrap(), 2);
        assert_eq!(b.get_u16().unwrap(), 2);
        assert_eq!(a.remaining(), 0);
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn test_inflate_roundtrip() {

        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let payload = b"fixedStep chrom=chr1 start=1 step=1".to_vec();

        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        encoder.write_all(&payload).unwrap();
        let deflated = encoder.finish().unwrap();

        assert_eq!(inflate(&deflated, Compression::Deflate).unwrap(), payload);

        let snapped = snap::raw::Encoder::new().compress_vec(&payload).unwrap();

        assert_eq!(inflate(&snapped, Compression::Snappy).unwrap(), payload);
        assert_eq!(inflate(&payload, Compression::None  ).unwrap(), payload);
    }
}
