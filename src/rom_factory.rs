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

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteordered::Endianness;
use memmap2::Mmap;

use crate::error::{BigFileError, Result};
use crate::rom_buffer::{inflate, Compression, RomBuffer};

/* -------------------------------------------------------------------------- */

// The four ways of serving random-access reads. All variants return
// bit-identical data; they differ in file-descriptor cost and in how
// concurrent readers are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RomFactoryKind {
    // single handle, I/O serialized on a mutex
    Synchronized,
    // one handle per factory; duplicate() opens a new descriptor
    PerCursor,
    // shared descriptor with positioned reads, parallel without locking
    ThreadSafe,
    // shared memory map, parallel
    MemoryMapped,
}

/* -------------------------------------------------------------------------- */

// All four providers are Send, so a duplicated reader can be moved to
// another thread; only the per-cursor variant is not Sync
pub trait RomFactory: Send {

    fn order(&self) -> Endianness;

    fn set_order(&mut self, order: Endianness);

    fn size(&self) -> u64;

    // Raw bytes of a file region
    fn fetch(&self, offset: u64, size: usize) -> Result<RomBuffer>;

    // Independent cursor over the same file
    fn duplicate(&self) -> Result<Box<dyn RomFactory>>;

    // Fresh buffer over the decompressed contents of a file region
    fn decompress(&self, offset: u64, size: usize, compression: Compression) -> Result<RomBuffer> {
        let block = self.fetch(offset, size)?;
        let data  = inflate(block.as_slice(), compression)?;
        Ok(RomBuffer::from_vec(data, self.order()))
    }

}

/* -------------------------------------------------------------------------- */

pub fn open_rom_factory(path: &Path, kind: RomFactoryKind) -> Result<Box<dyn RomFactory>> {
    match kind {
        RomFactoryKind::Synchronized => Ok(Box::new(SyncRomFactory  ::open(path)?)),
        RomFactoryKind::PerCursor    => Ok(Box::new(CursorRomFactory::open(path)?)),
        RomFactoryKind::ThreadSafe   => Ok(Box::new(PreadRomFactory ::open(path)?)),
        RomFactoryKind::MemoryMapped => Ok(Box::new(MmapRomFactory  ::open(path)?)),
    }
}

fn check_region(offset: u64, size: usize, file_size: u64) -> Result<()> {
    let end = offset.checked_add(size as u64).ok_or(BigFileError::Truncated)?;
    if end > file_size {
        return Err(BigFileError::Truncated);
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buffer, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut position = offset;
    let mut buffer   = buffer;
    while !buffer.is_empty() {
        let n = file.seek_read(buffer, position)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "failed to fill buffer"));
        }
        position += n as u64;
        let rest   = buffer;
        buffer     = &mut rest[n..];
    }
    Ok(())
}

/* Shared handle, reads serialized on a mutex
 * -------------------------------------------------------------------------- */

pub struct SyncRomFactory {
    file : Arc<Mutex<File>>,
    size : u64,
    order: Endianness,
}

impl SyncRomFactory {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(SyncRomFactory {
            file : Arc::new(Mutex::new(file)),
            size : size,
            order: Endianness::Little,
        })
    }
}

impl RomFactory for SyncRomFactory {

    fn order(&self) -> Endianness {
        self.order
    }

    fn set_order(&mut self, order: Endianness) {
        self.order = order;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn fetch(&self, offset: u64, size: usize) -> Result<RomBuffer> {
        check_region(offset, size, self.size)?;
        let mut file = self.file.lock().map_err(|_|
            io::Error::new(io::ErrorKind::Other, "file lock poisoned")
        )?;
        let mut buffer = vec![0u8; size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer)?;
        Ok(RomBuffer::from_vec(buffer, self.order))
    }

    fn duplicate(&self) -> Result<Box<dyn RomFactory>> {
        Ok(Box::new(SyncRomFactory {
            file : self.file.clone(),
            size : self.size,
            order: self.order,
        }))
    }

}

/* One descriptor per cursor; not safe for concurrent use, callers
 * duplicate() per thread
 * -------------------------------------------------------------------------- */

pub struct CursorRomFactory {
    path : PathBuf,
    file : RefCell<File>,
    size : u64,
    order: Endianness,
}

impl CursorRomFactory {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(CursorRomFactory {
            path : path.to_path_buf(),
            file : RefCell::new(file),
            size : size,
            order: Endianness::Little,
        })
    }
}

impl RomFactory for CursorRomFactory {

    fn order(&self) -> Endianness {
        self.order
    }

    fn set_order(&mut self, order: Endianness) {
        self.order = order;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn fetch(&self, offset: u64, size: usize) -> Result<RomBuffer> {
        check_region(offset, size, self.size)?;
        let mut file   = self.file.borrow_mut();
        let mut buffer = vec![0u8; size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer)?;
        Ok(RomBuffer::from_vec(buffer, self.order))
    }

    fn duplicate(&self) -> Result<Box<dyn RomFactory>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(CursorRomFactory {
            path : self.path.clone(),
            file : RefCell::new(file),
            size : self.size,
            order: self.order,
        }))
    }

}

/* Shared descriptor with positioned reads
 * -------------------------------------------------------------------------- */

pub struct PreadRomFactory {
    file : Arc<File>,
    size : u64,
    order: Endianness,
}

impl PreadRomFactory {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(PreadRomFactory {
            file : Arc::new(file),
            size : size,
            order: Endianness::Little,
        })
    }
}

impl RomFactory for PreadRomFactory {

    fn order(&self) -> Endianness {
        self.order
    }

    fn set_order(&mut self, order: Endianness) {
        self.order = order;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn fetch(&self, offset: u64, size: usize) -> Result<RomBuffer> {
        check_region(offset, size, self.size)?;
        let mut buffer = vec![0u8; size];
        read_exact_at(&self.file, &mut buffer, offset)?;
        Ok(RomBuffer::from_vec(buffer, self.order))
    }

    fn duplicate(&self) -> Result<Box<dyn RomFactory>> {
        Ok(Box::new(PreadRomFactory {
            file : self.file.clone(),
            size : self.size,
            order: self.order,
        }))
    }

}

/* Shared memory map
 * -------------------------------------------------------------------------- */

pub struct MmapRomFactory {
    map  : Arc<Mmap>,
    order: Endianness,
}

impl MmapRomFactory {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let map  = unsafe { Mmap::map(&file)? };
        Ok(MmapRomFactory {
            map  : Arc::new(map),
            order: Endianness::Little,
        })
    }
}

impl RomFactory for MmapRomFactory {

    fn order(&self) -> Endianness {
        self.order
    }

    fn set_order(&mut self, order: Endianness) {
        self.order = order;
    }

    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn fetch(&self, offset: u64, size: usize) -> Result<RomBuffer> {
        check_region(offset, size, self.size())?;
        Ok(RomBuffer::from_mmap(self.map.clone(), offset as usize, size, self.order))
    }

    fn duplicate(&self) -> Result<Box<dyn RomFactory>> {
        Ok(Box::new(MmapRomFactory {
            map  : self.map.clone(),
            order: self.order,
        }))
    }

    // Decompression reads straight from the map; only the uncompressed
    // case needs a view at all
    fn decompress(&self, offset: u64, size: usize, compression: Compression) -> Result<RomBuffer> {
        let block = self.fetch(offset, size)?;
        if compression == Compression::None {
            return Ok(block);
        }
        let data = inflate(block.as_slice(), compression)?;
        Ok(RomBuffer::from_vec(data, self.order))
    }

}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */
