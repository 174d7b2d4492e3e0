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

use std::io::{Seek, Write};

use crate::error::{BigFileError, Result};
use crate::ordered_output::OrderedDataOutput;
use crate::rom_factory::RomFactory;

/* -------------------------------------------------------------------------- */

pub const BPT_MAGIC: u32 = 0x78CA8C91;

pub const BPT_DEFAULT_BLOCK_SIZE: u32 = 256;

const BPT_HEADER_BYTES: u64 = 32;

/* -------------------------------------------------------------------------- */

// One chromosome: name, dense id assigned by the tree, length in bases
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BPlusLeaf {
    pub key   : String,
    pub id    : u32,
    pub length: u32,
}

/* -------------------------------------------------------------------------- */

// On-disk B+ tree mapping chromosome names to (id, length)
#[derive(Clone, Debug, Default)]
pub struct BPlusTree {
    pub block_size: u32,
    pub key_size  : u32,
    pub val_size  : u32,
    pub item_count: u64,
    root_offset   : u64,
}

/* -------------------------------------------------------------------------- */

impl BPlusTree {

    pub fn read(factory: &dyn RomFactory, offset: u64) -> Result<BPlusTree> {
        let mut header = factory.fetch(offset, BPT_HEADER_BYTES as usize)?;

        if header.get_u32()? != BPT_MAGIC {
            return Err(BigFileError::Format("chromosome B+ tree"));
        }
        let block_size = header.get_u32()?;
        let key_size   = header.get_u32()?;
        let val_size   = header.get_u32()?;
        let item_count = header.get_u64()?;
        let _reserved  = header.get_u64()?;

        if val_size != 8 {
            return Err(BigFileError::Format("chromosome B+ tree"));
        }

        Ok(BPlusTree {
            block_size : block_size,
            key_size   : key_size,
            val_size   : val_size,
            item_count : item_count,
            root_offset: offset + BPT_HEADER_BYTES,
        })
    }

    pub fn lookup(&self, factory: &dyn RomFactory, name: &str) -> Result<Option<(u32, u32)>> {
        if name.len() > self.key_size as usize || self.item_count == 0 {
            return Ok(None);
        }
        let mut query = vec![0u8; self.key_size as usize];
        query[..name.len()].copy_from_slice(name.as_bytes());

        self.lookup_node(factory, self.root_offset, &query)
    }

    fn lookup_node(&self, factory: &dyn RomFactory, offset: u64, query: &[u8]) -> Result<Option<(u32, u32)>> {
        let (is_leaf, count) = self.read_node_header(factory, offset)?;

        let child_bytes = self.key_size as usize + 8;
        let mut body    = factory.fetch(offset + 4, count * child_bytes)?;

        if is_leaf {
            let mut keys   = Vec::with_capacity(count);
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                keys  .push(body.get_bytes(self.key_size as usize)?);
                values.push((body.get_u32()?, body.get_u32()?));
            }
            match keys.binary_search_by(|key| key.as_slice().cmp(query)) {
                Ok(i)  => Ok(Some(values[i])),
                Err(_) => Ok(None),
            }
        } else {
            let mut keys     = Vec::with_capacity(count);
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                keys    .push(body.get_bytes(self.key_size as usize)?);
                children.push(body.get_u64()?);
            }
            // rightmost child whose first key is not past the query
            let i = keys.partition_point(|key| key.as_slice() <= query);
            if i == 0 {
                return Ok(None);
            }
            self.lookup_node(factory, children[i - 1], query)
        }
    }

    pub fn traverse(&self, factory: &dyn RomFactory) -> Result<Vec<BPlusLeaf>> {
        let mut leaves = Vec::with_capacity(self.item_count as usize);
        if self.item_count > 0 {
            self.traverse_node(factory, self.root_offset, &mut leaves)?;
        }
        Ok(leaves)
    }

    fn traverse_node(&self, factory: &dyn RomFactory, offset: u64, leaves: &mut Vec<BPlusLeaf>) -> Result<()> {
        let (is_leaf, count) = self.read_node_header(factory, offset)?;

        let child_bytes = self.key_size as usize + 8;
        let mut body    = factory.fetch(offset + 4, count * child_bytes)?;

        if is_leaf {
            for _ in 0..count {
                let key    = body.get_bytes(self.key_size as usize)?;
                let id     = body.get_u32()?;
                let length = body.get_u32()?;
                let name   = String::from_utf8_lossy(&key)
                    .trim_end_matches('\x00')
                    .to_string();
                leaves.push(BPlusLeaf { key: name, id: id, length: length });
            }
        } else {
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                body.get_bytes(self.key_size as usize)?;
                children.push(body.get_u64()?);
            }
            for child in children {
                self.traverse_node(factory, child, leaves)?;
            }
        }
        Ok(())
    }

    fn read_node_header(&self, factory: &dyn RomFactory, offset: u64) -> Result<(bool, usize)> {
        let mut header = factory.fetch(offset, 4)?;
        let is_leaf    = header.get_u8()?;
        let _reserved  = header.get_u8()?;
        let count      = header.get_u16()? as usize;
        Ok((is_leaf != 0, count))
    }

    // Bottom-up balanced build; nodes are laid out breadth-first with the
    // root immediately after the header
    pub fn write<W: Write + Seek>(
        output    : &mut OrderedDataOutput<W>,
        items     : &[BPlusLeaf],
        block_size: u32,
    ) -> Result<()> {

        let mut sorted: Vec<&BPlusLeaf> = items.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        for pair in sorted.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(BigFileError::DuplicateKey(pair[0].key.clone()));
            }
        }

        let key_size = sorted.iter().map(|c| c.key.len()).max().unwrap_or(1).max(1);
        let block    = block_size.max(2) as usize;

        output.write_u32(BPT_MAGIC)?;
        output.write_u32(block as u32)?;
        output.write_u32(key_size as u32)?;
        output.write_u32(8)?;
        output.write_u64(sorted.len() as u64)?;
        output.write_u64(0)?;

        if sorted.is_empty() {
            return Ok(());
        }

        // node fan-outs per level, root level first
        let mut levels = vec![chunk_sizes(sorted.len(), block)];
        while levels.last().map(|l| l.len()).unwrap_or(1) > 1 {
            let below = levels.last().map(|l| l.len()).unwrap_or(1);
            levels.push(chunk_sizes(below, block));
        }
        levels.reverse();

        // breadth-first offsets; every child entry is key_size + 8 bytes
        let header_end  = output.tell()?;
        let mut offsets = Vec::with_capacity(levels.len());
        let mut cursor  = header_end;
        for level in &levels {
            let mut level_offsets = Vec::with_capacity(level.len());
            for &count in level {
                level_offsets.push(cursor);
                cursor += 4 + count as u64 * (key_size as u64 + 8);
            }
            offsets.push(level_offsets);
        }

        // first covered item per node per level, for internal node keys
        let mut starts: Vec<Vec<usize>> = vec![Vec::new(); levels.len()];
        let mut acc = 0;
        starts[levels.len() - 1] = levels[levels.len() - 1]
            .iter()
            .map(|&count| { let s = acc; acc += count; s })
            .collect();
        for li in (0..levels.len().saturating_sub(1)).rev() {
            let mut child = 0;
            for &count in &levels[li] {
                let s = starts[li + 1][child];
                starts[li].push(s);
                child += count;
            }
        }

        let mut key = vec![0u8; key_size];
        for (li, level) in levels.iter().enumerate() {
            let is_leaf   = li == levels.len() - 1;
            let mut child = 0;
            for &count in level {
                output.write_u8(if is_leaf { 1 } else { 0 })?;
                output.write_u8(0)?;
                output.write_u16(count as u16)?;
                for _ in 0..count {
                    let item = if is_leaf {
                        sorted[child]
                    } else {
                        sorted[starts[li + 1][child]]
                    };
                    key.iter_mut().for_each(|b| *b = 0);
                    key[..item.key.len()].copy_from_slice(item.key.as_bytes());
                    output.write_all(&key)?;
                    if is_leaf {
                        output.write_u32(item.id)?;
                        output.write_u32(item.length)?;
                    } else {
                        output.write_u64(offsets[li + 1][child])?;
                    }
                    child += 1;
                }
            }
        }
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */

fn chunk_sizes(n: usize, block: usize) -> Vec<usize> {
    let mut sizes = vec![block; n / block];
    if n % block > 0 {
        sizes.push(n % block);
    }
    sizes
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use byteordered::Endianness;

    use super::{BPlusLeaf, BPlusTree};
    use crate::ordered_output::OrderedDataOutput;
    use crate::rom_factory::{open_rom_factory, RomFactory, RomFactoryKind};

    fn write_tree(items: &[BPlusLeaf], block_size: u32, order: Endianness) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();

        let mut output = OrderedDataOutput::create(file.path(), order).unwrap();
        BPlusTree::write(&mut output, items, block_size).unwrap();
        output.flush().unwrap();

        file
    }

    fn chromosomes() -> Vec<BPlusLeaf> {
        vec![
            BPlusLeaf { key: "chr1".to_string(), id: 0, length: 10000 },
            BPlusLeaf { key: "chr2".to_string(), id: 1, length: 20000 },
            BPlusLeaf { key: "chrX".to_string(), id: 2, length:  5000 },
        ]
    }

    #[test]
    fn test_bptree_lookup() {

        let file = write_tree(&chromosomes(), 256, Endianness::Little);

        let mut factory = open_rom_factory(file.path(), RomFactoryKind::Synchronized).unwrap();
        factory.set_order(Endianness::Little);

        let tree = BPlusTree::read(factory.as_ref(), 0).unwrap();

        assert_eq!(tree.item_count, 3);
        assert_eq!(tree.lookup(factory.as_ref(), "chr2").unwrap(), Some((1, 20000)));
        assert_eq!(tree.lookup(factory.as_ref(), "chrX").unwrap(), Some((2,  5000)));
        assert_eq!(tree.lookup(factory.as_ref(), "chr3").unwrap(), None);
        assert_eq!(tree.lookup(factory.as_ref(), "chr22_gl000199_random").unwrap(), None);
    }

    #[test]
    fn test_bptree_traverse_sorted() {

        // small fan-out forces a multi-level tree
        let mut items = Vec::new();
        for i in 0..20 {
            items.push(BPlusLeaf {
                key   : format!("chr{:02}", i),
                id    : i as u32,
                length: 1000 + i as u32,
            });
        }

        let file = write_tree(&items, 2, Endianness::Big);

        let mut factory = open_rom_factory(file.path(), RomFactoryKind::MemoryMapped).unwrap();
        factory.set_order(Endianness::Big);

        let tree   = BPlusTree::read(factory.as_ref(), 0).unwrap();
        let leaves = tree.traverse(factory.as_ref()).unwrap();

        assert_eq!(leaves.len(), 20);
        for pair in leaves.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }
        for leaf in &leaves {
            assert_eq!(
                tree.lookup(factory.as_ref(), &leaf.key).unwrap(),
                Some((leaf.id, leaf.length))
            );
        }
    }

    #[test]
    fn test_bptree_duplicate_key() {

        let mut items = chromosomes();
        items.push(BPlusLeaf { key: "chr1".to_string(), id: 3, length: 1 });

        let file = tempfile::NamedTempFile::new().unwrap();

        let mut output = OrderedDataOutput::create(file.path(), Endianness::Little).unwrap();
        let result = BPlusTree::write(&mut output, &items, 256);

        assert!(result.is_err());
    }
}
