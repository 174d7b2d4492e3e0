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
use std::io::Cursor;
use std::path::Path;

use async_stream::stream;
use byteordered::Endianness;
use futures::executor::{block_on_stream, BlockingStream};
use futures::StreamExt;
use futures_core::stream::Stream;

use crate::bbi::{write_bbi_file, BbiFile, BbiHeader, BbiWriteConfig, ZoomLevel};
use crate::bbi::{BIGWIG_MAGIC, PREFETCH_LEVEL_FAST};
use crate::bptree::BPlusLeaf;
use crate::error::{BigFileError, Result};
use crate::ordered_output::OrderedDataOutput;
use crate::rom_buffer::{Compression, RomBuffer};
use crate::rom_factory::{open_rom_factory, RomFactory, RomFactoryKind};
use crate::rtree::Interval;
use crate::summary::BigSummary;
use crate::zoom::{bin_value_intervals, bin_zoom_records, read_zoom_records, ValueInterval};

/* -------------------------------------------------------------------------- */

pub const WIG_TYPE_BED_GRAPH: u8 = 1;
pub const WIG_TYPE_VARIABLE : u8 = 2;
pub const WIG_TYPE_FIXED    : u8 = 3;

const WIG_SECTION_HEADER_BYTES: usize = 24;

/* -------------------------------------------------------------------------- */

pub fn is_bigwig_file<P: AsRef<Path>>(path: P) -> Result<bool> {

    let factory = open_rom_factory(path.as_ref(), RomFactoryKind::Synchronized)?;

    let magic = factory.fetch(0, 4)?.get_u32()?;

    Ok(magic == BIGWIG_MAGIC || magic.swap_bytes() == BIGWIG_MAGIC)

}

/* -------------------------------------------------------------------------- */

// One decoded WIG section; values within a section are sorted by start
// and do not overlap
#[derive(Clone, Debug, PartialEq)]
pub enum WigSection {
    FixedStep {
        chrom : String,
        start : u32,
        step  : u32,
        span  : u32,
        values: Vec<f32>,
    },
    VariableStep {
        chrom    : String,
        span     : u32,
        positions: Vec<u32>,
        values   : Vec<f32>,
    },
    BedGraph {
        chrom : String,
        starts: Vec<u32>,
        ends  : Vec<u32>,
        values: Vec<f32>,
    },
}

/* -------------------------------------------------------------------------- */

impl WigSection {

    pub fn chrom(&self) -> &str {
        match self {
            WigSection::FixedStep    { chrom, .. } => chrom,
            WigSection::VariableStep { chrom, .. } => chrom,
            WigSection::BedGraph     { chrom, .. } => chrom,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WigSection::FixedStep    { values, .. } => values.len(),
            WigSection::VariableStep { values, .. } => values.len(),
            WigSection::BedGraph     { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Start of the first record
    pub fn start(&self) -> u32 {
        match self {
            WigSection::FixedStep    { start, .. }     => *start,
            WigSection::VariableStep { positions, .. } => positions.first().copied().unwrap_or(0),
            WigSection::BedGraph     { starts, .. }    => starts.first().copied().unwrap_or(0),
        }
    }

    // End of the last record
    pub fn end(&self) -> u32 {
        match self {
            WigSection::FixedStep { start, step, span, values, .. } => {
                if values.is_empty() {
                    *start
                } else {
                    start + (values.len() as u32 - 1) * step + span
                }
            }
            WigSection::VariableStep { span, positions, .. } => {
                positions.last().map(|p| p + span).unwrap_or(0)
            }
            WigSection::BedGraph { ends, .. } => ends.last().copied().unwrap_or(0),
        }
    }

    fn kind(&self) -> u8 {
        match self {
            WigSection::FixedStep    { .. } => WIG_TYPE_FIXED,
            WigSection::VariableStep { .. } => WIG_TYPE_VARIABLE,
            WigSection::BedGraph     { .. } => WIG_TYPE_BED_GRAPH,
        }
    }

    // Per-record value intervals, the unit of the summary statistics and
    // the zoom pyramid
    pub(crate) fn value_intervals(&self, chrom_ix: u32) -> Vec<ValueInterval> {
        match self {
            WigSection::FixedStep { start, step, span, values, .. } => values
                .iter()
                .enumerate()
                .map(|(i, &value)| {
                    let s = start + i as u32 * step;
                    ValueInterval { chrom_ix: chrom_ix, start: s, end: s + span, value: value }
                })
                .collect(),
            WigSection::VariableStep { span, positions, values, .. } => positions
                .iter()
                .zip(values.iter())
                .map(|(&s, &value)| {
                    ValueInterval { chrom_ix: chrom_ix, start: s, end: s + span, value: value }
                })
                .collect(),
            WigSection::BedGraph { starts, ends, values, .. } => starts
                .iter()
                .zip(ends.iter())
                .zip(values.iter())
                .map(|((&s, &e), &value)| {
                    ValueInterval { chrom_ix: chrom_ix, start: s, end: e, value: value }
                })
                .collect(),
        }
    }

    fn encode(&self, chrom_ix: u32, block: &mut OrderedDataOutput<Cursor<Vec<u8>>>) -> Result<()> {
        if self.len() > u16::MAX as usize {
            return Err(BigFileError::Format("WIG section"));
        }
        let (step, span) = match self {
            WigSection::FixedStep    { step, span, .. } => (*step, *span),
            WigSection::VariableStep { span, .. }       => (0, *span),
            WigSection::BedGraph     { .. }             => (0, 0),
        };
        block.write_u32(chrom_ix)?;
        block.write_u32(self.start())?;
        block.write_u32(self.end())?;
        block.write_u32(step)?;
        block.write_u32(span)?;
        block.write_u8(self.kind())?;
        block.write_u8(0)?;
        block.write_u16(self.len() as u16)?;

        match self {
            WigSection::FixedStep { values, .. } => {
                for &value in values {
                    block.write_f32(value)?;
                }
            }
            WigSection::VariableStep { positions, values, .. } => {
                for (&position, &value) in positions.iter().zip(values.iter()) {
                    block.write_u32(position)?;
                    block.write_f32(value)?;
                }
            }
            WigSection::BedGraph { starts, ends, values, .. } => {
                for ((&s, &e), &value) in starts.iter().zip(ends.iter()).zip(values.iter()) {
                    block.write_u32(s)?;
                    block.write_u32(e)?;
                    block.write_f32(value)?;
                }
            }
        }
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */

// Decode one data block into the section of records consistent with the
// query. Records are sorted by start within a block, so decoding stops
// at the first non-match after a match.
fn decode_section(
    buffer  : &mut RomBuffer,
    chrom   : &str,
    chrom_ix: u32,
    start   : u32,
    end     : u32,
    overlaps: bool,
) -> Result<Option<WigSection>> {

    let h_chrom   = buffer.get_u32()?;
    let h_start   = buffer.get_u32()?;
    let _h_end    = buffer.get_u32()?;
    let h_step    = buffer.get_u32()?;
    let h_span    = buffer.get_u32()?;
    let kind      = buffer.get_u8()?;
    let _reserved = buffer.get_u8()?;
    let count     = buffer.get_u16()? as usize;

    if h_chrom != chrom_ix {
        return Ok(None);
    }

    match kind {
        WIG_TYPE_FIXED => {
            if h_step == 0 {
                return Err(BigFileError::Format("WIG data block"));
            }
            // rebase the section so the first value aligns with the first
            // step cell consistent with the query
            let margin = start % h_step;
            let shift: i64 = if margin == 0 {
                0
            } else if overlaps {
                -(margin as i64)
            } else {
                (h_step - margin) as i64
            };
            let real_start = (start as i64 + shift).max(h_start as i64) as u32;
            let i0 = if real_start <= h_start {
                0
            } else {
                ((real_start - h_start + h_step - 1) / h_step) as usize
            };

            let mut section_start = 0;
            let mut values        = Vec::new();
            buffer.set_position(WIG_SECTION_HEADER_BYTES + 4 * i0);
            for i in i0..count {
                let position = h_start + i as u32 * h_step;
                let consistent = if overlaps {
                    position < end
                } else {
                    position + h_step <= end
                };
                if !consistent {
                    break;
                }
                if values.is_empty() {
                    section_start = position;
                }
                values.push(buffer.get_f32()?);
            }
            if values.is_empty() {
                return Ok(None);
            }
            Ok(Some(WigSection::FixedStep {
                chrom : chrom.to_string(),
                start : section_start,
                step  : h_step,
                span  : h_span,
                values: values,
            }))
        }
        WIG_TYPE_VARIABLE => {
            let mut positions = Vec::new();
            let mut values    = Vec::new();
            for _ in 0..count {
                let position = buffer.get_u32()?;
                let value    = buffer.get_f32()?;
                let consistent = if overlaps {
                    position < end && position + h_span > start
                } else {
                    position >= start && position + h_span <= end
                };
                if consistent {
                    positions.push(position);
                    values.push(value);
                } else if !positions.is_empty() {
                    break;
                }
            }
            if values.is_empty() {
                return Ok(None);
            }
            Ok(Some(WigSection::VariableStep {
                chrom    : chrom.to_string(),
                span     : h_span,
                positions: positions,
                values   : values,
            }))
        }
        WIG_TYPE_BED_GRAPH => {
            let mut starts = Vec::new();
            let mut ends   = Vec::new();
            let mut values = Vec::new();
            for _ in 0..count {
                let s     = buffer.get_u32()?;
                let e     = buffer.get_u32()?;
                let value = buffer.get_f32()?;
                let consistent = if overlaps {
                    s < end && e > start
                } else {
                    s >= start && e <= end
                };
                if consistent {
                    starts.push(s);
                    ends.push(e);
                    values.push(value);
                } else if !starts.is_empty() {
                    break;
                }
            }
            if values.is_empty() {
                return Ok(None);
            }
            Ok(Some(WigSection::BedGraph {
                chrom : chrom.to_string(),
                starts: starts,
                ends  : ends,
                values: values,
            }))
        }
        _ => Err(BigFileError::Format("WIG data block")),
    }
}

/* -------------------------------------------------------------------------- */

pub enum OptionBigWig {
    ZoomLevelCount(usize),
    Compression(Compression),
    ByteOrder(Endianness),
    BlockSize(u32),
    ItemsPerSlot(usize),
}

/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub struct BigWigParameters {
    pub zoom_level_count: usize,
    pub compression     : Compression,
    pub byte_order      : Endianness,
    pub block_size      : u32,
    pub items_per_slot  : usize,
}

/* -------------------------------------------------------------------------- */

impl BigWigParameters {
    pub fn insert_option(&mut self, option: OptionBigWig) {
        match option {
            OptionBigWig::ZoomLevelCount(x) => self.zoom_level_count = x,
            OptionBigWig::Compression(x)    => self.compression      = x,
            OptionBigWig::ByteOrder(x)      => self.byte_order       = x,
            OptionBigWig::BlockSize(x)      => self.block_size       = x,
            OptionBigWig::ItemsPerSlot(x)   => self.items_per_slot   = x,
        }
    }
}

/* -------------------------------------------------------------------------- */

impl Default for BigWigParameters {
    fn default() -> Self {
        BigWigParameters {
            zoom_level_count: 8,
            compression     : Compression::Deflate,
            byte_order      : Endianness::Little,
            block_size      : 256,
            items_per_slot  : 1024,
        }
    }
}

/* -------------------------------------------------------------------------- */

pub enum BigWigFile {}

/* -------------------------------------------------------------------------- */

impl BigWigFile {

    pub fn open<P: AsRef<Path>>(path: P) -> Result<BigWigReader> {

        BigWigReader::open_with(path, RomFactoryKind::Synchronized, PREFETCH_LEVEL_FAST)

    }

    pub fn open_with<P: AsRef<Path>>(path: P, kind: RomFactoryKind, prefetch: i32) -> Result<BigWigReader> {

        BigWigReader::open_with(path, kind, prefetch)

    }

    pub fn write<P: AsRef<Path>>(
        sections   : &[WigSection],
        chrom_sizes: &[(String, u32)],
        path       : P,
        options    : Vec<OptionBigWig>,
    ) -> Result<()> {

        let mut parameters = BigWigParameters::default();

        for option in options {
            parameters.insert_option(option);
        }

        write_bigwig(sections, chrom_sizes, path.as_ref(), &parameters)

    }

}

/* -------------------------------------------------------------------------- */

pub struct BigWigReader {
    factory : Box<dyn RomFactory>,
    bwf     : BbiFile,
    seqnames: Vec<String>,
    lengths : Vec<u32>,
}

/* -------------------------------------------------------------------------- */

impl BigWigReader {

    pub fn open_with<P: AsRef<Path>>(path: P, kind: RomFactoryKind, prefetch: i32) -> Result<Self> {
        let mut factory = open_rom_factory(path.as_ref(), kind)?;
        let mut bwf     = BbiFile::open(factory.as_mut(), BIGWIG_MAGIC, prefetch)?;

        let leaves = bwf.chrom_tree(factory.as_ref())?.traverse(factory.as_ref())?;

        let mut seqnames = vec![String::new(); leaves.len()];
        let mut lengths  = vec![0; leaves.len()];
        for leaf in leaves {
            if leaf.id as usize >= seqnames.len() {
                return Err(BigFileError::Format("chromosome B+ tree"));
            }
            seqnames[leaf.id as usize] = leaf.key;
            lengths [leaf.id as usize] = leaf.length;
        }

        Ok(BigWigReader {
            factory : factory,
            bwf     : bwf,
            seqnames: seqnames,
            lengths : lengths,
        })
    }

    pub fn header(&self) -> &BbiHeader {
        &self.bwf.header
    }

    pub fn zoom_levels(&self) -> &[ZoomLevel] {
        &self.bwf.zoom
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = (&str, u32)> {
        self.seqnames
            .iter()
            .map(|name| name.as_str())
            .zip(self.lengths.iter().copied())
    }

    fn resolve(&mut self, chrom: &str) -> Result<(u32, u32)> {
        self.bwf
            .chrom_tree(self.factory.as_ref())?
            .lookup(self.factory.as_ref(), chrom)?
            .ok_or_else(|| BigFileError::NoSuchElement(chrom.to_string()))
    }

    pub fn query_stream<'a>(
        &'a mut self,
        chrom   : &'a str,
        start   : u32,
        end     : u32,
        overlaps: bool,
    ) -> impl Stream<Item = Result<WigSection>> + 'a {

        stream! {

            let chrom_ix = match self.resolve(chrom) {
                Ok((chrom_ix, _)) => chrom_ix,
                Err(err)          => { yield Err(err); return; }
            };

            let query = Interval { chrom_ix: chrom_ix, start: start, end: end };

            let leaves = match self.bwf.index(self.factory.as_ref()) {
                Ok(index) => index.find_overlapping_blocks(self.factory.as_ref(), query),
                Err(err)  => Err(err),
            };
            let leaves = match leaves {
                Ok(leaves) => leaves,
                Err(err)   => { yield Err(err); return; }
            };

            for leaf in leaves {
                let section = match self.bwf.decompressed_block(self.factory.as_ref(), chrom_ix, &leaf) {
                    Ok(mut buffer) => decode_section(&mut buffer, chrom, chrom_ix, start, end, overlaps),
                    Err(err)       => Err(err),
                };
                match section {
                    Ok(Some(section)) => yield Ok(section),
                    Ok(None)          => {}
                    Err(err)          => { yield Err(err); return; }
                }
            }
        }
    }

    pub fn query<'a>(
        &'a mut self,
        chrom   : &'a str,
        start   : u32,
        end     : u32,
        overlaps: bool,
    ) -> BlockingStream<impl Stream<Item = Result<WigSection>> + 'a> {

        let s = Box::pin(self.query_stream(chrom, start, end, overlaps));

        block_on_stream(s)
    }

    // Per-bin summary statistics, served from the coarsest zoom level
    // that still resolves the requested bins
    pub fn summarize(&mut self, chrom: &str, start: u32, end: u32, num_bins: usize) -> Result<Vec<BigSummary>> {
        let (chrom_ix, _) = self.resolve(chrom)?;

        if num_bins == 0 || start >= end {
            return Ok(vec![BigSummary::default(); num_bins]);
        }

        let desired = ((end - start) as u64 / num_bins as u64).min(u32::MAX as u64) as u32;

        if let Some(level) = self.bwf.zoom_level_for(desired) {
            let query  = Interval { chrom_ix: chrom_ix, start: start, end: end };
            let leaves = self
                .bwf
                .zoom_index(self.factory.as_ref(), level)?
                .find_overlapping_blocks(self.factory.as_ref(), query)?;

            let mut records = Vec::new();
            for leaf in leaves {
                let mut buffer = self.bwf.decompressed_block(self.factory.as_ref(), chrom_ix, &leaf)?;
                records.extend(read_zoom_records(&mut buffer)?);
            }
            Ok(bin_zoom_records(&records, chrom_ix, start, end, num_bins))
        } else {
            let mut items = Vec::new();
            {
                let mut stream = Box::pin(self.query_stream(chrom, start, end, true));
                while let Some(section) = futures::executor::block_on(stream.next()) {
                    let section = section?;
                    for interval in section.value_intervals(chrom_ix) {
                        items.push((interval.start, interval.end, interval.value));
                    }
                }
            }
            Ok(bin_value_intervals(items, start, end, num_bins))
        }
    }

    pub fn total_summary(&self) -> BigSummary {
        self.bwf.total_summary.unwrap_or_default()
    }

    // Independent reader over the same file; caches are not shared
    pub fn duplicate(&self) -> Result<BigWigReader> {
        Ok(BigWigReader {
            factory : self.factory.duplicate()?,
            bwf     : self.bwf.duplicate(),
            seqnames: self.seqnames.clone(),
            lengths : self.lengths.clone(),
        })
    }

    pub fn close(self) {}

}

/* -------------------------------------------------------------------------- */

fn write_bigwig(
    sections   : &[WigSection],
    chrom_sizes: &[(String, u32)],
    path       : &Path,
    parameters : &BigWigParameters,
) -> Result<()> {

    // first traversal: chromosome numbering, sort checks, statistics
    let mut chrom_ids: HashMap<&str, u32> = HashMap::new();
    let mut chroms    : Vec<BPlusLeaf>    = Vec::new();
    let mut last_chrom: Option<&str>      = None;
    let mut last_end                      = 0;

    let mut total      = BigSummary::default();
    let mut zoom_items = Vec::new();

    for section in sections {
        if section.is_empty() {
            continue;
        }
        let chrom = section.chrom();
        let chrom_ix = match chrom_ids.get(chrom) {
            Some(&chrom_ix) => {
                if last_chrom != Some(chrom) {
                    return Err(BigFileError::SortOrder(format!(
                        "sections of chromosome `{}` are not consecutive", chrom
                    )));
                }
                if section.start() < last_end {
                    return Err(BigFileError::SortOrder(format!(
                        "overlapping sections on chromosome `{}`", chrom
                    )));
                }
                chrom_ix
            }
            None => {
                let chrom_ix = chroms.len() as u32;
                let length   = chrom_sizes
                    .iter()
                    .find(|(name, _)| name == chrom)
                    .map(|(_, length)| *length)
                    .ok_or_else(|| BigFileError::NoSuchElement(chrom.to_string()))?;
                chrom_ids.insert(chrom, chrom_ix);
                chroms.push(BPlusLeaf {
                    key   : chrom.to_string(),
                    id    : chrom_ix,
                    length: length,
                });
                chrom_ix
            }
        };
        last_chrom = Some(chrom);
        last_end   = section.end();

        let mut previous_end = 0;
        for interval in section.value_intervals(chrom_ix) {
            if interval.start < previous_end {
                return Err(BigFileError::SortOrder(format!(
                    "overlapping records within a section on chromosome `{}`", chrom
                )));
            }
            previous_end = interval.end;
            total.add_value(interval.value as f64, (interval.end - interval.start) as u64);
            zoom_items.push(interval);
        }
    }

    // second traversal: encode one data block per section
    let mut blocks = Vec::new();
    for section in sections {
        if section.is_empty() {
            continue;
        }
        let chrom_ix = chrom_ids[section.chrom()];
        let mut block = OrderedDataOutput::new(Cursor::new(Vec::new()), parameters.byte_order);
        section.encode(chrom_ix, &mut block)?;
        blocks.push(crate::bbi::EncodedBlock {
            chrom_ix: chrom_ix,
            start   : section.start(),
            end     : section.end(),
            data    : block.into_writer().into_inner(),
        });
    }

    let config = BbiWriteConfig {
        magic              : BIGWIG_MAGIC,
        compression        : parameters.compression,
        order              : parameters.byte_order,
        zoom_level_count   : parameters.zoom_level_count,
        block_size         : parameters.block_size,
        items_per_slot     : parameters.items_per_slot,
        field_count        : 0,
        defined_field_count: 0,
    };

    write_bbi_file(path, &config, &chroms, &blocks, &zoom_items, &total)
}
