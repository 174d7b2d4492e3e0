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

use std::collections::BTreeMap;
use std::io::{Seek, Write};

use log::debug;

use crate::bbi::ZoomLevel;
use crate::error::Result;
use crate::ordered_output::OrderedDataOutput;
use crate::rom_buffer::{Compression, RomBuffer};
use crate::rtree::RTreeIndex;
use crate::rtree::RTreeLeaf;
use crate::summary::BigSummary;

/* -------------------------------------------------------------------------- */

pub(crate) const ZOOM_RECORD_BYTES: usize = 32;

/* -------------------------------------------------------------------------- */

// One value interval of the raw data, the unit the zoom pyramid is
// aggregated from
#[derive(Clone, Copy, Debug)]
pub(crate) struct ValueInterval {
    pub chrom_ix: u32,
    pub start   : u32,
    pub end     : u32,
    pub value   : f32,
}

/* -------------------------------------------------------------------------- */

// Pre-aggregated summary of one zoom bin
#[derive(Clone, Copy, Debug)]
pub struct ZoomRecord {
    pub chrom_ix: u32,
    pub start   : u32,
    pub end     : u32,
    pub summary : BigSummary,
}

/* -------------------------------------------------------------------------- */

impl ZoomRecord {

    pub(crate) fn read(buffer: &mut RomBuffer) -> Result<ZoomRecord> {
        let chrom_ix = buffer.get_u32()?;
        let start    = buffer.get_u32()?;
        let end      = buffer.get_u32()?;
        let valid    = buffer.get_u32()?;
        let min      = buffer.get_f32()?;
        let max      = buffer.get_f32()?;
        let sum      = buffer.get_f32()?;
        let squares  = buffer.get_f32()?;
        Ok(ZoomRecord {
            chrom_ix: chrom_ix,
            start   : start,
            end     : end,
            summary : BigSummary {
                count      : valid as u64,
                min        : min as f64,
                max        : max as f64,
                sum        : sum as f64,
                sum_squares: squares as f64,
            },
        })
    }

    pub(crate) fn write<W: Write + Seek>(&self, output: &mut OrderedDataOutput<W>) -> Result<()> {
        output.write_u32(self.chrom_ix)?;
        output.write_u32(self.start)?;
        output.write_u32(self.end)?;
        output.write_u32(self.summary.count.min(u32::MAX as u64) as u32)?;
        output.write_f32(self.summary.min as f32)?;
        output.write_f32(self.summary.max as f32)?;
        output.write_f32(self.summary.sum as f32)?;
        output.write_f32(self.summary.sum_squares as f32)?;
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */

pub(crate) fn read_zoom_records(buffer: &mut RomBuffer) -> Result<Vec<ZoomRecord>> {
    let count       = buffer.len() / ZOOM_RECORD_BYTES;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(ZoomRecord::read(buffer)?);
    }
    Ok(records)
}

/* -------------------------------------------------------------------------- */

// Aggregate raw value intervals into zoom bins of the given width.
// Record bounds track the covered range, not the full bin.
fn bin_raw(items: &[ValueInterval], reduction: u32) -> Vec<ZoomRecord> {
    let mut bins: BTreeMap<(u32, u32), ZoomRecord> = BTreeMap::new();

    for item in items {
        let mut pos = item.start;
        while pos < item.end {
            let bin       = pos / reduction;
            let bin_end   = (bin as u64 + 1) * reduction as u64;
            let chunk_end = (item.end as u64).min(bin_end) as u32;

            let record = bins.entry((item.chrom_ix, bin)).or_insert(ZoomRecord {
                chrom_ix: item.chrom_ix,
                start   : pos,
                end     : pos,
                summary : BigSummary::default(),
            });
            record.start = record.start.min(pos);
            record.end   = record.end.max(chunk_end);
            record.summary.add_value(item.value as f64, (chunk_end - pos) as u64);

            pos = chunk_end;
        }
    }
    bins.into_values().collect()
}

// Fold one zoom level into the next coarser one. Reductions grow by a
// factor of four, so bins nest and the summaries combine exactly.
fn fold_records(records: &[ZoomRecord], reduction: u32) -> Vec<ZoomRecord> {
    let mut bins: BTreeMap<(u32, u32), ZoomRecord> = BTreeMap::new();

    for record in records {
        let bin   = record.start / reduction;
        let entry = bins.entry((record.chrom_ix, bin)).or_insert(ZoomRecord {
            chrom_ix: record.chrom_ix,
            start   : record.start,
            end     : record.end,
            summary : BigSummary::default(),
        });
        entry.start = entry.start.min(record.start);
        entry.end   = entry.end.max(record.end);
        entry.summary.add(&record.summary);
    }
    bins.into_values().collect()
}

/* -------------------------------------------------------------------------- */

// Append the zoom pyramid after the main index: per level a record
// count, compressed record blocks and an R+ tree over them. Returns the
// written levels and the largest uncompressed block.
pub(crate) fn write_zoom_levels<W: Write + Seek>(
    output           : &mut OrderedDataOutput<W>,
    items            : &[ValueInterval],
    zoom_level_count : usize,
    records_per_block: usize,
    block_size       : u32,
    compression      : Compression,
) -> Result<(Vec<ZoomLevel>, u64)> {

    let mut levels           = Vec::new();
    let mut max_uncompressed = 0u64;

    if items.is_empty() || zoom_level_count == 0 {
        return Ok((levels, max_uncompressed));
    }

    let span_sum: u64 = items.iter().map(|i| (i.end - i.start) as u64).sum();
    let count         = items.len() as u64;
    let longest       = items.iter().map(|i| i.end).max().unwrap_or(0);

    let initial = ((span_sum + count - 1) / count).max(1).min(u32::MAX as u64) as u32;

    let mut reduction = initial.saturating_mul(10);
    let mut records   = bin_raw(items, reduction);

    for level_index in 0..zoom_level_count {
        if level_index > 0 {
            let next = reduction.saturating_mul(4);
            if next >= longest {
                break;
            }
            reduction = next;
            records   = fold_records(&records, reduction);
        }
        debug!("zoom level {}: reduction {}, {} records", level_index, reduction, records.len());

        let data_offset = output.tell()?;
        output.write_u32(records.len() as u32)?;

        let mut leaves = Vec::new();
        for chunk in records.chunks(records_per_block.max(1)) {
            let block_offset = output.tell()?;
            let n = output.with_block(compression, |block| {
                for record in chunk {
                    record.write(block)?;
                }
                Ok(())
            })?;
            max_uncompressed = max_uncompressed.max(n);

            let first = &chunk[0];
            let last  = &chunk[chunk.len() - 1];
            leaves.push(RTreeLeaf {
                start_chrom_ix: first.chrom_ix,
                start_base    : first.start,
                end_chrom_ix  : last.chrom_ix,
                end_base      : last.end,
                data_offset   : block_offset,
                data_size     : output.tell()? - block_offset,
            });
        }

        let index_offset = output.tell()?;
        RTreeIndex::write(output, &leaves, block_size, records_per_block as u32, index_offset)?;

        levels.push(ZoomLevel {
            reduction_level: reduction,
            data_offset    : data_offset,
            index_offset   : index_offset,
        });
    }

    Ok((levels, max_uncompressed))
}

/* Summarize binning
 * -------------------------------------------------------------------------- */

fn bin_boundary(start: u32, end: u32, num_bins: usize, i: usize) -> u32 {
    start + ((end - start) as u64 * i as u64 / num_bins as u64) as u32
}

fn bin_of(start: u32, end: u32, num_bins: usize, position: u32) -> usize {
    ((position - start) as u64 * num_bins as u64 / (end - start) as u64) as usize
}

// Exact binning of raw value intervals, weighted by base overlap
pub(crate) fn bin_value_intervals<I>(items: I, start: u32, end: u32, num_bins: usize) -> Vec<BigSummary>
where
    I: IntoIterator<Item = (u32, u32, f32)>,
{
    let mut bins = vec![BigSummary::default(); num_bins];
    if start >= end || num_bins == 0 {
        return bins;
    }
    for (s, e, value) in items {
        let s = s.max(start);
        let e = e.min(end);
        if s >= e {
            continue;
        }
        let first = bin_of(start, end, num_bins, s);
        let last  = bin_of(start, end, num_bins, e - 1);
        for i in first..=last.min(num_bins - 1) {
            let b0 = bin_boundary(start, end, num_bins, i);
            let b1 = bin_boundary(start, end, num_bins, i + 1);
            let overlap = e.min(b1).saturating_sub(s.max(b0));
            bins[i].add_value(value as f64, overlap as u64);
        }
    }
    bins
}

// Binning of pre-aggregated zoom records; contributions are scaled by
// the base-overlap fraction, min/max are taken unscaled
pub(crate) fn bin_zoom_records(
    records : &[ZoomRecord],
    chrom_ix: u32,
    start   : u32,
    end     : u32,
    num_bins: usize,
) -> Vec<BigSummary> {
    let mut bins = vec![BigSummary::default(); num_bins];
    if start >= end || num_bins == 0 {
        return bins;
    }
    for record in records {
        if record.chrom_ix != chrom_ix || record.start >= end || record.end <= start {
            continue;
        }
        let record_len = (record.end - record.start) as f64;
        if record_len <= 0.0 || record.summary.is_empty() {
            continue;
        }
        let s = record.start.max(start);
        let e = record.end.min(end);

        let first = bin_of(start, end, num_bins, s);
        let last  = bin_of(start, end, num_bins, e - 1);
        for i in first..=last.min(num_bins - 1) {
            let b0 = bin_boundary(start, end, num_bins, i);
            let b1 = bin_boundary(start, end, num_bins, i + 1);
            let overlap = e.min(b1).saturating_sub(s.max(b0)) as f64;
            if overlap <= 0.0 {
                continue;
            }
            let fraction = overlap / record_len;
            bins[i].count       += (record.summary.count as f64 * fraction).round() as u64;
            bins[i].sum         += record.summary.sum * fraction;
            bins[i].sum_squares += record.summary.sum_squares * fraction;
            bins[i].min          = bins[i].min.min(record.summary.min);
            bins[i].max          = bins[i].max.max(record.summary.max);
        }
    }
    bins
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */
