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
use std::io::Cursor;
use std::path::Path;

use async_stream::stream;
use byteordered::Endianness;
use futures::executor::{block_on_stream, BlockingStream};
use futures::StreamExt;
use futures_core::stream::Stream;

use crate::bbi::{write_bbi_file, BbiFile, BbiHeader, BbiWriteConfig, EncodedBlock, ZoomLevel};
use crate::bbi::{BIGBED_MAGIC, PREFETCH_LEVEL_FAST};
use crate::bptree::BPlusLeaf;
use crate::error::{BigFileError, Result};
use crate::ordered_output::OrderedDataOutput;
use crate::rom_buffer::{Compression, RomBuffer};
use crate::rom_factory::{open_rom_factory, RomFactory, RomFactoryKind};
use crate::rtree::Interval;
use crate::summary::BigSummary;
use crate::zoom::{bin_value_intervals, bin_zoom_records, read_zoom_records, ValueInterval};

/* -------------------------------------------------------------------------- */

pub fn is_bigbed_file<P: AsRef<Path>>(path: P) -> Result<bool> {

    let factory = open_rom_factory(path.as_ref(), RomFactoryKind::Synchronized)?;

    let magic = factory.fetch(0, 4)?.get_u32()?;

    Ok(magic == BIGBED_MAGIC || magic.swap_bytes() == BIGBED_MAGIC)

}

/* -------------------------------------------------------------------------- */

// One feature record; rest holds the tab-separated extra fields and may
// be empty
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BedEntry {
    pub chrom: String,
    pub start: u32,
    pub end  : u32,
    pub rest : String,
}

/* -------------------------------------------------------------------------- */

impl BedEntry {

    // 3 fixed fields plus the extra fields carried in rest
    pub fn field_count(&self) -> u16 {
        if self.rest.is_empty() {
            3
        } else {
            3 + self.rest.split('\t').count() as u16
        }
    }

}

/* -------------------------------------------------------------------------- */

impl fmt::Display for BedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rest.is_empty() {
            write!(f, "{}\t{}\t{}", self.chrom, self.start, self.end)
        } else {
            write!(f, "{}\t{}\t{}\t{}", self.chrom, self.start, self.end, self.rest)
        }
    }
}

/* -------------------------------------------------------------------------- */

// Decode the records of one block consistent with the query. Records
// are sorted by (chrom, start), so decoding stops at the first
// non-match after a match.
fn decode_block(
    buffer  : &mut RomBuffer,
    chrom   : &str,
    chrom_ix: u32,
    start   : u32,
    end     : u32,
    overlaps: bool,
) -> Result<Vec<BedEntry>> {

    let mut entries = Vec::new();
    let mut matched = false;

    while buffer.remaining() > 12 {
        let r_chrom = buffer.get_u32()?;
        let s       = buffer.get_u32()?;
        let e       = buffer.get_u32()?;
        let rest    = buffer.get_cstring()?;

        let consistent = r_chrom == chrom_ix
            && if overlaps {
                s < end && e > start
            } else {
                s >= start && e <= end
            };

        if consistent {
            matched = true;
            entries.push(BedEntry {
                chrom: chrom.to_string(),
                start: s,
                end  : e,
                rest : rest,
            });
        } else if matched {
            break;
        }
    }
    Ok(entries)
}

/* -------------------------------------------------------------------------- */

pub enum OptionBigBed {
    ZoomLevelCount(usize),
    Compression(Compression),
    ByteOrder(Endianness),
    BlockSize(u32),
    ItemsPerSlot(usize),
}

/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub struct BigBedParameters {
    pub zoom_level_count: usize,
    pub compression     : Compression,
    pub byte_order      : Endianness,
    pub block_size      : u32,
    pub items_per_slot  : usize,
}

/* -------------------------------------------------------------------------- */

impl BigBedParameters {
    pub fn insert_option(&mut self, option: OptionBigBed) {
        match option {
            OptionBigBed::ZoomLevelCount(x) => self.zoom_level_count = x,
            OptionBigBed::Compression(x)    => self.compression      = x,
            OptionBigBed::ByteOrder(x)      => self.byte_order       = x,
            OptionBigBed::BlockSize(x)      => self.block_size       = x,
            OptionBigBed::ItemsPerSlot(x)   => self.items_per_slot   = x,
        }
    }
}

/* -------------------------------------------------------------------------- */

impl Default for BigBedParameters {
    fn default() -> Self {
        BigBedParameters {
            zoom_level_count: 8,
            compression     : Compression::Deflate,
            byte_order      : Endianness::Little,
            block_size      : 256,
            items_per_slot  : 1024,
        }
    }
}

/* -------------------------------------------------------------------------- */

pub enum BigBedFile {}

/* -------------------------------------------------------------------------- */

impl BigBedFile {

    pub fn open<P: AsRef<Path>>(path: P) -> Result<BigBedReader> {

        BigBedReader::open_with(path, RomFactoryKind::Synchronized, PREFETCH_LEVEL_FAST)

    }

    pub fn open_with<P: AsRef<Path>>(path: P, kind: RomFactoryKind, prefetch: i32) -> Result<BigBedReader> {

        BigBedReader::open_with(path, kind, prefetch)

    }

    pub fn write<P: AsRef<Path>>(
        entries    : &[BedEntry],
        chrom_sizes: &[(String, u32)],
        path       : P,
        options    : Vec<OptionBigBed>,
    ) -> Result<()> {

        let mut parameters = BigBedParameters::default();

        for option in options {
            parameters.insert_option(option);
        }

        write_bigbed(entries, chrom_sizes, path.as_ref(), &parameters)

    }

}

/* -------------------------------------------------------------------------- */

pub struct BigBedReader {
    factory : Box<dyn RomFactory>,
    bbf     : BbiFile,
    seqnames: Vec<String>,
    lengths : Vec<u32>,
}

/* -------------------------------------------------------------------------- */

impl BigBedReader {

    pub fn open_with<P: AsRef<Path>>(path: P, kind: RomFactoryKind, prefetch: i32) -> Result<Self> {
        let mut factory = open_rom_factory(path.as_ref(), kind)?;
        let mut bbf     = BbiFile::open(factory.as_mut(), BIGBED_MAGIC, prefetch)?;

        let leaves = bbf.chrom_tree(factory.as_ref())?.traverse(factory.as_ref())?;

        let mut seqnames = vec![String::new(); leaves.len()];
        let mut lengths  = vec![0; leaves.len()];
        for leaf in leaves {
            if leaf.id as usize >= seqnames.len() {
                return Err(BigFileError::Format("chromosome B+ tree"));
            }
            seqnames[leaf.id as usize] = leaf.key;
            lengths [leaf.id as usize] = leaf.length;
        }

        Ok(BigBedReader {
            factory : factory,
            bbf     : bbf,
            seqnames: seqnames,
            lengths : lengths,
        })
    }

    pub fn header(&self) -> &BbiHeader {
        &self.bbf.header
    }

    pub fn zoom_levels(&self) -> &[ZoomLevel] {
        &self.bbf.zoom
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = (&str, u32)> {
        self.seqnames
            .iter()
            .map(|name| name.as_str())
            .zip(self.lengths.iter().copied())
    }

    fn resolve(&mut self, chrom: &str) -> Result<(u32, u32)> {
        self.bbf
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
    ) -> impl Stream<Item = Result<BedEntry>> + 'a {

        stream! {

            let chrom_ix = match self.resolve(chrom) {
                Ok((chrom_ix, _)) => chrom_ix,
                Err(err)          => { yield Err(err); return; }
            };

            let query = Interval { chrom_ix: chrom_ix, start: start, end: end };

            let leaves = match self.bbf.index(self.factory.as_ref()) {
                Ok(index) => index.find_overlapping_blocks(self.factory.as_ref(), query),
                Err(err)  => Err(err),
            };
            let leaves = match leaves {
                Ok(leaves) => leaves,
                Err(err)   => { yield Err(err); return; }
            };

            for leaf in leaves {
                let entries = match self.bbf.decompressed_block(self.factory.as_ref(), chrom_ix, &leaf) {
                    Ok(mut buffer) => decode_block(&mut buffer, chrom, chrom_ix, start, end, overlaps),
                    Err(err)       => Err(err),
                };
                match entries {
                    Ok(entries) => {
                        for entry in entries {
                            yield Ok(entry);
                        }
                    }
                    Err(err) => { yield Err(err); return; }
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
    ) -> BlockingStream<impl Stream<Item = Result<BedEntry>> + 'a> {

        let s = Box::pin(self.query_stream(chrom, start, end, overlaps));

        block_on_stream(s)
    }

    // Per-bin coverage statistics; each covered base counts with value 1
    pub fn summarize(&mut self, chrom: &str, start: u32, end: u32, num_bins: usize) -> Result<Vec<BigSummary>> {
        let (chrom_ix, _) = self.resolve(chrom)?;

        if num_bins == 0 || start >= end {
            return Ok(vec![BigSummary::default(); num_bins]);
        }

        let desired = ((end - start) as u64 / num_bins as u64).min(u32::MAX as u64) as u32;

        if let Some(level) = self.bbf.zoom_level_for(desired) {
            let query  = Interval { chrom_ix: chrom_ix, start: start, end: end };
            let leaves = self
                .bbf
                .zoom_index(self.factory.as_ref(), level)?
                .find_overlapping_blocks(self.factory.as_ref(), query)?;

            let mut records = Vec::new();
            for leaf in leaves {
                let mut buffer = self.bbf.decompressed_block(self.factory.as_ref(), chrom_ix, &leaf)?;
                records.extend(read_zoom_records(&mut buffer)?);
            }
            Ok(bin_zoom_records(&records, chrom_ix, start, end, num_bins))
        } else {
            let mut items = Vec::new();
            {
                let mut stream = Box::pin(self.query_stream(chrom, start, end, true));
                while let Some(entry) = futures::executor::block_on(stream.next()) {
                    let entry = entry?;
                    items.push((entry.start, entry.end, 1.0));
                }
            }
            Ok(bin_value_intervals(items, start, end, num_bins))
        }
    }

    pub fn total_summary(&self) -> BigSummary {
        self.bbf.total_summary.unwrap_or_default()
    }

    pub fn duplicate(&self) -> Result<BigBedReader> {
        Ok(BigBedReader {
            factory : self.factory.duplicate()?,
            bbf     : self.bbf.duplicate(),
            seqnames: self.seqnames.clone(),
            lengths : self.lengths.clone(),
        })
    }

    pub fn close(self) {}

}

/* -------------------------------------------------------------------------- */

fn write_bigbed(
    entries    : &[BedEntry],
    chrom_sizes: &[(String, u32)],
    path       : &Path,
    parameters : &BigBedParameters,
) -> Result<()> {

    // first traversal: chromosome numbering, sort checks, statistics
    let mut chrom_ids: HashMap<&str, u32> = HashMap::new();
    let mut chroms    : Vec<BPlusLeaf>    = Vec::new();
    let mut last_chrom: Option<&str>      = None;
    let mut last_start                    = 0;

    let mut total      = BigSummary::default();
    let mut zoom_items = Vec::new();

    for entry in entries {
        if entry.start >= entry.end {
            return Err(BigFileError::SortOrder(format!(
                "empty interval on chromosome `{}`", entry.chrom
            )));
        }
        let chrom = entry.chrom.as_str();
        let chrom_ix = match chrom_ids.get(chrom) {
            Some(&chrom_ix) => {
                if last_chrom != Some(chrom) {
                    return Err(BigFileError::SortOrder(format!(
                        "records of chromosome `{}` are not consecutive", chrom
                    )));
                }
                if entry.start < last_start {
                    return Err(BigFileError::SortOrder(format!(
                        "records on chromosome `{}` are not sorted by start", chrom
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
        last_start = entry.start;

        total.add_value(1.0, (entry.end - entry.start) as u64);
        zoom_items.push(ValueInterval {
            chrom_ix: chrom_ix,
            start   : entry.start,
            end     : entry.end,
            value   : 1.0,
        });
    }

    // second traversal: per chromosome, blocks of items_per_slot records
    let mut blocks = Vec::new();
    let mut i      = 0;
    while i < entries.len() {
        let chrom    = entries[i].chrom.as_str();
        let chrom_ix = chrom_ids[chrom];

        let mut j = i;
        while j < entries.len() && entries[j].chrom == chrom && j - i < parameters.items_per_slot.max(1) {
            j += 1;
        }
        let chunk = &entries[i..j];

        let mut block = OrderedDataOutput::new(Cursor::new(Vec::new()), parameters.byte_order);
        for entry in chunk {
            block.write_u32(chrom_ix)?;
            block.write_u32(entry.start)?;
            block.write_u32(entry.end)?;
            block.write_cstring(&entry.rest)?;
        }
        blocks.push(EncodedBlock {
            chrom_ix: chrom_ix,
            start   : chunk[0].start,
            end     : chunk.iter().map(|e| e.end).max().unwrap_or(chunk[0].end),
            data    : block.into_writer().into_inner(),
        });
        i = j;
    }

    let field_count = entries.first().map(|e| e.field_count()).unwrap_or(3);

    let config = BbiWriteConfig {
        magic              : BIGBED_MAGIC,
        compression        : parameters.compression,
        order              : parameters.byte_order,
        zoom_level_count   : parameters.zoom_level_count,
        block_size         : parameters.block_size,
        items_per_slot     : parameters.items_per_slot,
        field_count        : field_count,
        defined_field_count: field_count.min(12),
    };

    write_bbi_file(path, &config, &chroms, &blocks, &zoom_items, &total)
}
