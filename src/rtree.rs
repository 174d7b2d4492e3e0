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
use std::io::{Seek, Write};

use crate::error::{BigFileError, Result};
use crate::ordered_output::OrderedDataOutput;
use crate::rom_factory::RomFactory;

/* -------------------------------------------------------------------------- */

pub const RTREE_MAGIC: u32 = 0x2468ACE0;

const RTREE_HEADER_BYTES: u64 = 48;
const RTREE_LEAF_BYTES    : usize = 32;
const RTREE_INTERNAL_BYTES: usize = 24;

/* -------------------------------------------------------------------------- */

// Half-open genomic interval on a numbered chromosome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub chrom_ix: u32,
    pub start   : u32,
    pub end     : u32,
}

/* -------------------------------------------------------------------------- */

// One indexed data block. Bounds may span chromosomes; blocks may hold
// records straddling the query boundary, filtering is the decoder's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RTreeLeaf {
    pub start_chrom_ix: u32,
    pub start_base    : u32,
    pub end_chrom_ix  : u32,
    pub end_base      : u32,
    pub data_offset   : u64,
    pub data_size     : u64,
}

impl RTreeLeaf {
    fn overlaps(&self, query: Interval) -> bool {
        overlaps(
            self.start_chrom_ix, self.start_base,
            self.end_chrom_ix, self.end_base,
            query,
        )
    }
}

// Entries spanning several chromosomes are treated as covering every
// chromosome in [start_chrom_ix, end_chrom_ix] inclusively
fn overlaps(s_ci: u32, s_b: u32, e_ci: u32, e_b: u32, query: Interval) -> bool {
    if query.chrom_ix < s_ci || query.chrom_ix > e_ci {
        return false;
    }
    (s_ci < query.chrom_ix || s_b < query.end) && (e_ci > query.chrom_ix || e_b > query.start)
}

/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
enum RTreeNode {
    Leaf    (Vec<RTreeLeaf>),
    Internal(Vec<(u32, u32, u32, u32, u64)>),
}

/* -------------------------------------------------------------------------- */

// On-disk 1-D R+ tree mapping intervals to data block locations
#[derive(Clone, Debug, Default)]
pub struct RTreeIndex {
    pub block_size     : u32,
    pub item_count     : u64,
    pub start_chrom_ix : u32,
    pub start_base     : u32,
    pub end_chrom_ix   : u32,
    pub end_base       : u32,
    pub end_file_offset: u64,
    pub items_per_slot : u32,
    root_offset        : u64,
    prefetched         : Option<HashMap<u64, RTreeNode>>,
}

/* -------------------------------------------------------------------------- */

impl RTreeIndex {

    pub fn read(factory: &dyn RomFactory, offset: u64) -> Result<RTreeIndex> {
        let mut header = factory.fetch(offset, RTREE_HEADER_BYTES as usize)?;

        if header.get_u32()? != RTREE_MAGIC {
            return Err(BigFileError::Format("R+ tree index"));
        }

        Ok(RTreeIndex {
            block_size     : header.get_u32()?,
            item_count     : header.get_u64()?,
            start_chrom_ix : header.get_u32()?,
            start_base     : header.get_u32()?,
            end_chrom_ix   : header.get_u32()?,
            end_base       : header.get_u32()?,
            end_file_offset: header.get_u64()?,
            items_per_slot : { let v = header.get_u32()?; let _ = header.get_u32()?; v },
            root_offset    : offset + RTREE_HEADER_BYTES,
            prefetched     : None,
        })
    }

    // Materialize all internal nodes so queries touch the file only for
    // leaf nodes and data blocks
    pub fn prefetch(&mut self, factory: &dyn RomFactory) -> Result<()> {
        let mut nodes = HashMap::new();
        if self.item_count > 0 {
            self.prefetch_node(factory, self.root_offset, &mut nodes)?;
        }
        self.prefetched = Some(nodes);
        Ok(())
    }

    fn prefetch_node(
        &self,
        factory: &dyn RomFactory,
        offset : u64,
        nodes  : &mut HashMap<u64, RTreeNode>,
    ) -> Result<()> {
        let node = self.read_node(factory, offset)?;
        if let RTreeNode::Internal(children) = &node {
            let children = children.clone();
            nodes.insert(offset, node);
            for (_, _, _, _, child) in children {
                self.prefetch_node(factory, child, nodes)?;
            }
        }
        Ok(())
    }

    pub fn find_overlapping_blocks(
        &self,
        factory: &dyn RomFactory,
        query  : Interval,
    ) -> Result<Vec<RTreeLeaf>> {
        let mut blocks = Vec::new();
        if self.item_count > 0 {
            self.search(factory, self.root_offset, query, &mut blocks)?;
        }
        Ok(blocks)
    }

    fn search(
        &self,
        factory: &dyn RomFactory,
        offset : u64,
        query  : Interval,
        blocks : &mut Vec<RTreeLeaf>,
    ) -> Result<()> {
        let node = match self.prefetched.as_ref().and_then(|m| m.get(&offset)) {
            Some(node) => node.clone(),
            None       => self.read_node(factory, offset)?,
        };
        match node {
            RTreeNode::Leaf(leaves) => {
                for leaf in leaves {
                    if leaf.overlaps(query) {
                        blocks.push(leaf);
                    }
                }
            }
            RTreeNode::Internal(children) => {
                for (s_ci, s_b, e_ci, e_b, child) in children {
                    if overlaps(s_ci, s_b, e_ci, e_b, query) {
                        self.search(factory, child, query, blocks)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn read_node(&self, factory: &dyn RomFactory, offset: u64) -> Result<RTreeNode> {
        let mut header = factory.fetch(offset, 4)?;
        let is_leaf    = header.get_u8()?;
        let _reserved  = header.get_u8()?;
        let count      = header.get_u16()? as usize;

        if is_leaf != 0 {
            let mut body   = factory.fetch(offset + 4, count * RTREE_LEAF_BYTES)?;
            let mut leaves = Vec::with_capacity(count);
            for _ in 0..count {
                leaves.push(RTreeLeaf {
                    start_chrom_ix: body.get_u32()?,
                    start_base    : body.get_u32()?,
                    end_chrom_ix  : body.get_u32()?,
                    end_base      : body.get_u32()?,
                    data_offset   : body.get_u64()?,
                    data_size     : body.get_u64()?,
                });
            }
            Ok(RTreeNode::Leaf(leaves))
        } else {
            let mut body     = factory.fetch(offset + 4, count * RTREE_INTERNAL_BYTES)?;
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push((
                    body.get_u32()?,
                    body.get_u32()?,
                    body.get_u32()?,
                    body.get_u32()?,
                    body.get_u64()?,
                ));
            }
            Ok(RTreeNode::Internal(children))
        }
    }

    // Bottom-up bulk load over leaves known in advance; nodes are written
    // breadth-first from the root down
    pub fn write<W: Write + Seek>(
        output         : &mut OrderedDataOutput<W>,
        leaves         : &[RTreeLeaf],
        block_size     : u32,
        items_per_slot : u32,
        end_file_offset: u64,
    ) -> Result<()> {

        let mut sorted: Vec<RTreeLeaf> = leaves.to_vec();
        sorted.sort_by_key(|leaf| (leaf.start_chrom_ix, leaf.start_base));

        let block = block_size.max(2) as usize;

        let (s_ci, s_b) = sorted
            .first()
            .map(|l| (l.start_chrom_ix, l.start_base))
            .unwrap_or((0, 0));
        let (e_ci, e_b) = sorted
            .iter()
            .map(|l| (l.end_chrom_ix, l.end_base))
            .max()
            .unwrap_or((0, 0));

        output.write_u32(RTREE_MAGIC)?;
        output.write_u32(block as u32)?;
        output.write_u64(sorted.len() as u64)?;
        output.write_u32(s_ci)?;
        output.write_u32(s_b)?;
        output.write_u32(e_ci)?;
        output.write_u32(e_b)?;
        output.write_u64(end_file_offset)?;
        output.write_u32(items_per_slot)?;
        output.write_u32(0)?;

        if sorted.is_empty() {
            return Ok(());
        }

        // bounding boxes per level, bottom level first; each node is the
        // (start index, fan-out, bounds) of its children one level down
        type NodeBox = (usize, usize, (u32, u32, u32, u32));

        let leaf_box = |chunk: &[RTreeLeaf]| -> (u32, u32, u32, u32) {
            let (e_ci, e_b) = chunk.iter().map(|l| (l.end_chrom_ix, l.end_base)).max().unwrap_or((0, 0));
            (chunk[0].start_chrom_ix, chunk[0].start_base, e_ci, e_b)
        };

        let mut levels: Vec<Vec<NodeBox>> = Vec::new();
        let mut level: Vec<NodeBox> = sorted
            .chunks(block)
            .enumerate()
            .map(|(i, chunk)| (i * block, chunk.len(), leaf_box(chunk)))
            .collect();
        levels.push(level.clone());

        while level.len() > 1 {
            let mut parents: Vec<NodeBox> = Vec::new();
            for (i, chunk) in level.chunks(block).enumerate() {
                let s = chunk[0].2;
                let (e_ci, e_b) = chunk.iter().map(|n| (n.2 .2, n.2 .3)).max().unwrap_or((0, 0));
                parents.push((i * block, chunk.len(), (s.0, s.1, e_ci, e_b)));
            }
            levels.push(parents.clone());
            level = parents;
        }
        levels.reverse();

        // breadth-first offsets
        let header_end  = output.tell()?;
        let mut offsets = Vec::with_capacity(levels.len());
        let mut cursor  = header_end;
        for (li, level) in levels.iter().enumerate() {
            let entry_bytes = if li == levels.len() - 1 { RTREE_LEAF_BYTES } else { RTREE_INTERNAL_BYTES };
            let mut level_offsets = Vec::with_capacity(level.len());
            for &(_, count, _) in level {
                level_offsets.push(cursor);
                cursor += 4 + (count * entry_bytes) as u64;
            }
            offsets.push(level_offsets);
        }

        for (li, level) in levels.iter().enumerate() {
            let is_leaf = li == levels.len() - 1;
            for &(first, count, _) in level {
                output.write_u8(if is_leaf { 1 } else { 0 })?;
                output.write_u8(0)?;
                output.write_u16(count as u16)?;
                for k in 0..count {
                    if is_leaf {
                        let leaf = &sorted[first + k];
                        output.write_u32(leaf.start_chrom_ix)?;
                        output.write_u32(leaf.start_base)?;
                        output.write_u32(leaf.end_chrom_ix)?;
                        output.write_u32(leaf.end_base)?;
                        output.write_u64(leaf.data_offset)?;
                        output.write_u64(leaf.data_size)?;
                    } else {
                        let (_, _, bounds) = levels[li + 1][first + k];
                        output.write_u32(bounds.0)?;
                        output.write_u32(bounds.1)?;
                        output.write_u32(bounds.2)?;
                        output.write_u32(bounds.3)?;
                        output.write_u64(offsets[li + 1][first + k])?;
                    }
                }
            }
        }
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */
