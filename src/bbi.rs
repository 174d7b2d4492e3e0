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

use std::collections::HashMap;
use std::fmt;
use std::io::{Seek, Write};
use std::path::Path;

use byteordered::Endianness;
use log::debug;

use crate::bptree::{BPlusLeaf, BPlusTree, BPT_DEFAULT_BLOCK_SIZE};
use crate::error::{BigFileError, Result};
use crate::ordered_output::OrderedDataOutput;
use crate::rom_buffer::{Compression, RomBuffer};
use crate::rom_factory::RomFactory;
use crate::rtree::{RTreeIndex, RTreeLeaf};
use crate::summary::BigSummary;
use crate::zoom::{write_zoom_levels, ValueInterval};

/* -------------------------------------------------------------------------- */

pub const BIGWIG_MAGIC: u32 = 0x888FFC26;
pub const BIGBED_MAGIC: u32 = 0x8789F2EB;

pub const PREFETCH_LEVEL_OFF     : i32 = 0;
pub const PREFETCH_LEVEL_FAST    : i32 = 1;
pub const PREFETCH_LEVEL_DETAILED: i32 = 2;

pub(crate) const BBI_HEADER_BYTES   : u64 = 64;
pub(crate) const ZOOM_LEVEL_BYTES   : u64 = 24;
pub(crate) const TOTAL_SUMMARY_BYTES: u64 = 40;

/* -------------------------------------------------------------------------- */

// One entry of the zoom pyramid; reduction_level is the number of base
// pairs represented by a single zoom record
#[derive(Clone, Copy, Debug)]
pub struct ZoomLevel {
    pub reduction_level: u32,
    pub data_offset    : u64,
    pub index_offset   : u64,
}

/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug, Default)]
pub struct BbiHeader {
    pub magic               : u32,
    pub version             : u16,
    pub zoom_levels         : u16,
    pub chrom_tree_offset   : u64,
    pub full_data_offset    : u64,
    pub full_index_offset   : u64,
    pub field_count         : u16,
    pub defined_field_count : u16,
    pub auto_sql_offset     : u64,
    pub total_summary_offset: u64,
    pub uncompress_buf_size : u32,
    pub extension_offset    : u64,
}

/* -------------------------------------------------------------------------- */

impl BbiHeader {

    fn read(buffer: &mut RomBuffer, magic: u32) -> Result<BbiHeader> {
        let file_magic = buffer.get_u32()?;
        if file_magic != magic {
            return Err(BigFileError::BadSignature);
        }
        let header = BbiHeader {
            magic               : file_magic,
            version             : buffer.get_u16()?,
            zoom_levels         : buffer.get_u16()?,
            chrom_tree_offset   : buffer.get_u64()?,
            full_data_offset    : buffer.get_u64()?,
            full_index_offset   : buffer.get_u64()?,
            field_count         : buffer.get_u16()?,
            defined_field_count : buffer.get_u16()?,
            auto_sql_offset     : buffer.get_u64()?,
            total_summary_offset: buffer.get_u64()?,
            uncompress_buf_size : buffer.get_u32()?,
            extension_offset    : buffer.get_u64()?,
        };
        if header.version < 3 || header.version > 5 {
            return Err(BigFileError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }

    pub(crate) fn write<W: Write + Seek>(&self, output: &mut OrderedDataOutput<W>) -> Result<()> {
        output.write_u32(self.magic)?;
        output.write_u16(self.version)?;
        output.write_u16(self.zoom_levels)?;
        output.write_u64(self.chrom_tree_offset)?;
        output.write_u64(self.full_data_offset)?;
        output.write_u64(self.full_index_offset)?;
        output.write_u16(self.field_count)?;
        output.write_u16(self.defined_field_count)?;
        output.write_u64(self.auto_sql_offset)?;
        output.write_u64(self.total_summary_offset)?;
        output.write_u32(self.uncompress_buf_size)?;
        output.write_u64(self.extension_offset)?;
        Ok(())
    }

    // Per-block compression is implied by the header: a non-zero buffer
    // size selects compressed blocks, version 5 selects snappy
    pub fn compression(&self) -> Compression {
        if self.uncompress_buf_size == 0 {
            Compression::None
        } else if self.version >= 5 {
            Compression::Snappy
        } else {
            Compression::Deflate
        }
    }

}

/* -------------------------------------------------------------------------- */

impl fmt::Display for BbiHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "version            : {}", self.version)?;
        writeln!(f, "zoom levels        : {}", self.zoom_levels)?;
        writeln!(f, "chrom tree offset  : {}", self.chrom_tree_offset)?;
        writeln!(f, "full data offset   : {}", self.full_data_offset)?;
        writeln!(f, "full index offset  : {}", self.full_index_offset)?;
        writeln!(f, "uncompress buf size: {}", self.uncompress_buf_size)
    }
}

/* -------------------------------------------------------------------------- */

// Detect the byte order by comparing the leading magic against both
// encodings; exactly one must match
pub(crate) fn detect_order(factory: &mut dyn RomFactory, magic: u32) -> Result<Endianness> {
    let mut head  = factory.fetch(0, 4)?;
    let     value = head.get_u32()?;
    let order = if value == magic {
        factory.order()
    } else if value.swap_bytes() == magic {
        match factory.order() {
            Endianness::Big    => Endianness::Little,
            Endianness::Little => Endianness::Big,
        }
    } else {
        return Err(BigFileError::BadSignature);
    };
    factory.set_order(order);
    Ok(order)
}

/* -------------------------------------------------------------------------- */

// Parsed file-level state shared by the BigWig and BigBed readers. The
// chromosome tree and interval index are read lazily unless prefetching
// was requested at open time.
#[derive(Debug, Default)]
pub struct BbiFile {
    pub header       : BbiHeader,
    pub zoom         : Vec<ZoomLevel>,
    pub total_summary: Option<BigSummary>,
    chrom_tree       : Option<BPlusTree>,
    index            : Option<RTreeIndex>,
    zoom_indices     : HashMap<u32, RTreeIndex>,
    // single-slot cache of the last decompressed block
    last_block       : Option<((u32, u64, u64), RomBuffer)>,
}

/* -------------------------------------------------------------------------- */

impl BbiFile {

    pub fn open(factory: &mut dyn RomFactory, magic: u32, prefetch: i32) -> Result<BbiFile> {
        let order = detect_order(factory, magic)?;
        debug!("detected {} byte order", match order {
            Endianness::Big    => "big-endian",
            Endianness::Little => "little-endian",
        });

        let mut buffer = factory.fetch(0, BBI_HEADER_BYTES as usize)?;
        let header     = BbiHeader::read(&mut buffer, magic)?;

        let mut zoom = Vec::with_capacity(header.zoom_levels as usize);
        if header.zoom_levels > 0 {
            let mut buffer = factory.fetch(
                BBI_HEADER_BYTES,
                header.zoom_levels as usize * ZOOM_LEVEL_BYTES as usize,
            )?;
            for _ in 0..header.zoom_levels {
                let reduction_level = buffer.get_u32()?;
                let _reserved       = buffer.get_u32()?;
                zoom.push(ZoomLevel {
                    reduction_level: reduction_level,
                    data_offset    : buffer.get_u64()?,
                    index_offset   : buffer.get_u64()?,
                });
            }
        }

        let total_summary = if header.total_summary_offset > 0 {
            let mut buffer = factory.fetch(header.total_summary_offset, TOTAL_SUMMARY_BYTES as usize)?;
            Some(BigSummary::read(&mut buffer)?)
        } else {
            None
        };

        let mut bbi = BbiFile {
            header       : header,
            zoom         : zoom,
            total_summary: total_summary,
            chrom_tree   : None,
            index        : None,
            zoom_indices : HashMap::new(),
            last_block   : None,
        };

        if prefetch >= PREFETCH_LEVEL_FAST {
            bbi.chrom_tree(factory)?;
            bbi.index(factory)?;
        }
        if prefetch >= PREFETCH_LEVEL_DETAILED {
            if let Some(index) = bbi.index.as_mut() {
                index.prefetch(factory)?;
            }
        }

        Ok(bbi)
    }

    pub fn chrom_tree(&mut self, factory: &dyn RomFactory) -> Result<&BPlusTree> {
        if self.chrom_tree.is_none() {
            self.chrom_tree = Some(BPlusTree::read(factory, self.header.chrom_tree_offset)?);
        }
        match &self.chrom_tree {
            Some(tree) => Ok(tree),
            None       => Err(BigFileError::Format("chromosome B+ tree")),
        }
    }

    pub fn index(&mut self, factory: &dyn RomFactory) -> Result<&RTreeIndex> {
        if self.index.is_none() {
            self.index = Some(RTreeIndex::read(factory, self.header.full_index_offset)?);
        }
        match &self.index {
            Some(index) => Ok(index),
            None        => Err(BigFileError::Format("R+ tree index")),
        }
    }

    pub fn zoom_index(&mut self, factory: &dyn RomFactory, level: ZoomLevel) -> Result<&RTreeIndex> {
        if !self.zoom_indices.contains_key(&level.reduction_level) {
            let index = RTreeIndex::read(factory, level.index_offset)?;
            self.zoom_indices.insert(level.reduction_level, index);
        }
        match self.zoom_indices.get(&level.reduction_level) {
            Some(index) => Ok(index),
            None        => Err(BigFileError::Format("zoom R+ tree index")),
        }
    }

    // Largest reduction not exceeding the desired one; None selects the
    // unzoomed data
    pub fn zoom_level_for(&self, desired_reduction: u32) -> Option<ZoomLevel> {
        if desired_reduction < 2 {
            return None;
        }
        self.zoom
            .iter()
            .filter(|z| z.reduction_level <= desired_reduction)
            .max_by_key(|z| z.reduction_level)
            .copied()
    }

    // Decompressed view of a data block, served from the single-slot
    // cache on repeated access
    pub(crate) fn decompressed_block(
        &mut self,
        factory : &dyn RomFactory,
        chrom_ix: u32,
        leaf    : &RTreeLeaf,
    ) -> Result<RomBuffer> {
        let key = (chrom_ix, leaf.data_offset, leaf.data_size);
        if let Some((cached_key, buffer)) = &self.last_block {
            if *cached_key == key {
                let mut buffer = buffer.duplicate();
                buffer.set_position(0);
                return Ok(buffer);
            }
        }
        let buffer = factory.decompress(
            leaf.data_offset,
            leaf.data_size as usize,
            self.header.compression(),
        )?;
        self.last_block = Some((key, buffer.duplicate()));
        Ok(buffer)
    }

    // Metadata clone for an independent reader; the block cache is not
    // shared across duplicates
    pub fn duplicate(&self) -> BbiFile {
        BbiFile {
            header       : self.header.clone(),
            zoom         : self.zoom.clone(),
            total_summary: self.total_summary,
            chrom_tree   : self.chrom_tree.clone(),
            index        : self.index.clone(),
            zoom_indices : self.zoom_indices.clone(),
            last_block   : None,
        }
    }

}

/* Write pipeline shared by the BigWig and BigBed writers
 * -------------------------------------------------------------------------- */

pub(crate) struct BbiWriteConfig {
    pub magic              : u32,
    pub compression        : Compression,
    pub order              : Endianness,
    pub zoom_level_count   : usize,
    pub block_size         : u32,
    pub items_per_slot     : usize,
    pub field_count        : u16,
    pub defined_field_count: u16,
}

// One data block, already encoded in the target byte order
pub(crate) struct EncodedBlock {
    pub chrom_ix: u32,
    pub start   : u32,
    pub end     : u32,
    pub data    : Vec<u8>,
}

// Header and zoom-table space is reserved up front, the B+ tree, data
// blocks and R+ tree are written in order, the zoom pyramid and total
// summary follow, and finally the header is backpatched.
pub(crate) fn write_bbi_file(
    path       : &Path,
    config     : &BbiWriteConfig,
    chromosomes: &[BPlusLeaf],
    blocks     : &[EncodedBlock],
    zoom_items : &[ValueInterval],
    total      : &BigSummary,
) -> Result<()> {

    let mut output = OrderedDataOutput::create(path, config.order)?;

    output.skip_bytes(
        BBI_HEADER_BYTES as usize + config.zoom_level_count * ZOOM_LEVEL_BYTES as usize,
    )?;

    let total_summary_offset = output.tell()?;
    output.skip_bytes(TOTAL_SUMMARY_BYTES as usize)?;

    let chrom_tree_offset = output.tell()?;
    BPlusTree::write(&mut output, chromosomes, BPT_DEFAULT_BLOCK_SIZE)?;

    let full_data_offset = output.tell()?;
    output.write_u64(blocks.len() as u64)?;

    let mut leaves           = Vec::with_capacity(blocks.len());
    let mut max_uncompressed = 0u64;
    for block in blocks {
        let block_offset = output.tell()?;
        let n = output.with_block(config.compression, |sub| sub.write_all(&block.data))?;
        max_uncompressed = max_uncompressed.max(n);

        leaves.push(RTreeLeaf {
            start_chrom_ix: block.chrom_ix,
            start_base    : block.start,
            end_chrom_ix  : block.chrom_ix,
            end_base      : block.end,
            data_offset   : block_offset,
            data_size     : output.tell()? - block_offset,
        });
    }

    let full_index_offset = output.tell()?;
    RTreeIndex::write(&mut output, &leaves, config.block_size, 1, full_index_offset)?;

    let (zoom_levels, zoom_max) = write_zoom_levels(
        &mut output,
        zoom_items,
        config.zoom_level_count,
        config.items_per_slot,
        config.block_size,
        config.compression,
    )?;

    output.seek(total_summary_offset)?;
    total.write(&mut output)?;

    let header = BbiHeader {
        magic               : config.magic,
        version             : if config.compression == Compression::Snappy { 5 } else { 4 },
        zoom_levels         : zoom_levels.len() as u16,
        chrom_tree_offset   : chrom_tree_offset,
        full_data_offset    : full_data_offset,
        full_index_offset   : full_index_offset,
        field_count         : config.field_count,
        defined_field_count : config.defined_field_count,
        auto_sql_offset     : 0,
        total_summary_offset: total_summary_offset,
        uncompress_buf_size : if config.compression == Compression::None {
            0
        } else {
            max_uncompressed.max(zoom_max).max(1) as u32
        },
        extension_offset    : 0,
    };

    output.seek(0)?;
    header.write(&mut output)?;
    for level in &zoom_levels {
        output.write_u32(level.reduction_level)?;
        output.write_u32(0)?;
        output.write_u64(level.data_offset)?;
        output.write_u64(level.index_offset)?;
    }

    output.flush()?;
    Ok(())
}
