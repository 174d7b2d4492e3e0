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
use std::path::Path;

use log::warn;

use crate::error::{BigFileError, Result};
use crate::rom_buffer::{Compression, RomBuffer};
use crate::rom_factory::{open_rom_factory, RomFactory, RomFactoryKind};

/* -------------------------------------------------------------------------- */

const TDF_FIXED_HEADER_BYTES: usize = 24;

/* -------------------------------------------------------------------------- */

// IGV Tiled Data Format header; TDF files are always little-endian
#[derive(Clone, Debug)]
pub struct TdfHeader {
    pub version         : i32,
    pub index_offset    : u64,
    pub index_size      : usize,
    pub window_functions: Vec<String>,
    pub track_type      : String,
    pub track_line      : String,
    pub track_names     : Vec<String>,
    pub build           : String,
    pub flags           : i32,
}

/* -------------------------------------------------------------------------- */

impl TdfHeader {
    pub fn compressed(&self) -> bool {
        self.flags & 0x1 != 0
    }
}

/* -------------------------------------------------------------------------- */

// A dataset holds the tile table of one chromosome at one resolution
#[derive(Clone, Debug)]
pub struct TdfDataset {
    pub attributes: HashMap<String, String>,
    pub tile_width: i32,
    pub tiles     : Vec<(i64, i32)>,
}

/* -------------------------------------------------------------------------- */

// Groups carry key-value attributes only
#[derive(Clone, Debug)]
pub struct TdfGroup {
    pub attributes: HashMap<String, String>,
}

/* -------------------------------------------------------------------------- */

// One tile of per-track signal values; all tracks share the positional
// arrays
#[derive(Clone, Debug)]
pub enum TdfTile {
    Fixed {
        start : i32,
        span  : f32,
        values: Vec<Vec<f32>>,
    },
    Variable {
        span  : f32,
        starts: Vec<i32>,
        values: Vec<Vec<f32>>,
    },
    Bed {
        starts: Vec<i32>,
        ends  : Vec<i32>,
        values: Vec<Vec<f32>>,
    },
}

/* -------------------------------------------------------------------------- */

impl TdfTile {

    // Number of bins
    pub fn len(&self) -> usize {
        match self {
            TdfTile::Fixed    { values, .. } => values.first().map(|v| v.len()).unwrap_or(0),
            TdfTile::Variable { starts, .. } => starts.len(),
            TdfTile::Bed      { starts, .. } => starts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn track_count(&self) -> usize {
        match self {
            TdfTile::Fixed    { values, .. } => values.len(),
            TdfTile::Variable { values, .. } => values.len(),
            TdfTile::Bed      { values, .. } => values.len(),
        }
    }

    pub fn start(&self, idx: usize) -> i32 {
        match self {
            TdfTile::Fixed    { start, span, .. } => start + (idx as f32 * span) as i32,
            TdfTile::Variable { starts, .. }      => starts[idx],
            TdfTile::Bed      { starts, .. }      => starts[idx],
        }
    }

    pub fn end(&self, idx: usize) -> i32 {
        match self {
            TdfTile::Fixed    { start, span, .. } => start + ((idx as f32 + 1.0) * span) as i32,
            TdfTile::Variable { starts, span, .. } => starts[idx] + *span as i32,
            TdfTile::Bed      { ends, .. }         => ends[idx],
        }
    }

    pub fn value(&self, track: usize, idx: usize) -> f32 {
        match self {
            TdfTile::Fixed    { values, .. } => values[track][idx],
            TdfTile::Variable { values, .. } => values[track][idx],
            TdfTile::Bed      { values, .. } => values[track][idx],
        }
    }

}

/* -------------------------------------------------------------------------- */

fn decode_tile(buffer: &mut RomBuffer, tracks: usize) -> Result<TdfTile> {
    let kind = buffer.get_cstring()?;
    match kind.as_str() {
        "fixedStep" => {
            let count = buffer.get_i32()?.max(0) as usize;
            let start = buffer.get_i32()?;
            let span  = buffer.get_f32()?;
            let mut values = Vec::with_capacity(tracks);
            for _ in 0..tracks {
                values.push(buffer.get_f32s(count)?);
            }
            Ok(TdfTile::Fixed { start: start, span: span, values: values })
        }
        "variableStep" => {
            let _start = buffer.get_i32()?;
            let span   = buffer.get_f32()?;
            let count  = buffer.get_i32()?.max(0) as usize;
            let starts = buffer.get_i32s(count)?;
            let mut values = Vec::with_capacity(tracks);
            for _ in 0..tracks {
                values.push(buffer.get_f32s(count)?);
            }
            Ok(TdfTile::Variable { span: span, starts: starts, values: values })
        }
        "bed" | "bedWithName" => {
            if kind == "bedWithName" {
                warn!("decoding bedWithName tile as bed, dropping feature names");
            }
            let count  = buffer.get_i32()?.max(0) as usize;
            let starts = buffer.get_i32s(count)?;
            let ends   = buffer.get_i32s(count)?;
            let mut values = Vec::with_capacity(tracks);
            for _ in 0..tracks {
                values.push(buffer.get_f32s(count)?);
            }
            Ok(TdfTile::Bed { starts: starts, ends: ends, values: values })
        }
        _ => Err(BigFileError::Format("TDF tile")),
    }
}

/* -------------------------------------------------------------------------- */

pub struct TdfFile {
    factory : Box<dyn RomFactory>,
    header  : TdfHeader,
    datasets: HashMap<String, (u64, usize)>,
    groups  : HashMap<String, (u64, usize)>,
}

/* -------------------------------------------------------------------------- */

impl TdfFile {

    pub fn open<P: AsRef<Path>>(path: P) -> Result<TdfFile> {
        TdfFile::open_with(path, RomFactoryKind::Synchronized)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, kind: RomFactoryKind) -> Result<TdfFile> {
        let factory = open_rom_factory(path.as_ref(), kind)?;

        let mut head = factory.fetch(0, TDF_FIXED_HEADER_BYTES)?;

        let magic = head.get_bytes(4)?;
        if magic != b"TDF4" && magic != b"IBF4" {
            return Err(BigFileError::BadSignature);
        }
        let version      = head.get_i32()?;
        let index_offset = head.get_i64()?;
        let index_size   = head.get_i32()?;
        let header_size  = head.get_i32()?;

        if version < 4 {
            return Err(BigFileError::UnsupportedVersion(version as u16));
        }
        if index_offset < 0 || index_size < 0 || header_size < 0 {
            return Err(BigFileError::Format("TDF header"));
        }

        let mut buffer = factory.fetch(TDF_FIXED_HEADER_BYTES as u64, header_size as usize)?;

        let mut window_functions = Vec::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            window_functions.push(buffer.get_cstring()?);
        }
        let track_type = buffer.get_cstring()?;
        let track_line = buffer.get_cstring()?;
        let mut track_names = Vec::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            track_names.push(buffer.get_cstring()?);
        }
        let build = buffer.get_cstring()?;
        let flags = buffer.get_i32()?;

        let header = TdfHeader {
            version         : version,
            index_offset    : index_offset as u64,
            index_size      : index_size as usize,
            window_functions: window_functions,
            track_type      : track_type,
            track_line      : track_line,
            track_names     : track_names,
            build           : build,
            flags           : flags,
        };

        // master index: dataset and group locations
        let mut buffer = factory.fetch(header.index_offset, header.index_size)?;

        let mut datasets = HashMap::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            let name   = buffer.get_cstring()?;
            let offset = buffer.get_i64()?;
            let size   = buffer.get_i32()?;
            datasets.insert(name, (offset.max(0) as u64, size.max(0) as usize));
        }
        let mut groups = HashMap::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            let name   = buffer.get_cstring()?;
            let offset = buffer.get_i64()?;
            let size   = buffer.get_i32()?;
            groups.insert(name, (offset.max(0) as u64, size.max(0) as usize));
        }

        Ok(TdfFile {
            factory : factory,
            header  : header,
            datasets: datasets,
            groups  : groups,
        })
    }

    pub fn header(&self) -> &TdfHeader {
        &self.header
    }

    pub fn version(&self) -> i32 {
        self.header.version
    }

    pub fn track_names(&self) -> &[String] {
        &self.header.track_names
    }

    pub fn window_functions(&self) -> &[String] {
        &self.header.window_functions
    }

    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(|name| name.as_str())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|name| name.as_str())
    }

    pub fn get_dataset(&self, name: &str) -> Result<TdfDataset> {
        let &(offset, size) = self
            .datasets
            .get(name)
            .ok_or_else(|| BigFileError::NoSuchElement(name.to_string()))?;

        let mut buffer = self.factory.fetch(offset, size)?;

        let mut attributes = HashMap::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            let key   = buffer.get_cstring()?;
            let value = buffer.get_cstring()?;
            attributes.insert(key, value);
        }

        let data_type = buffer.get_cstring()?;
        if data_type != "float" {
            return Err(BigFileError::Format("TDF dataset"));
        }

        let tile_width = buffer.get_f32()? as i32;
        let tile_count = buffer.get_i32()?.max(0) as usize;

        let mut tiles = Vec::with_capacity(tile_count);
        for _ in 0..tile_count {
            let offset = buffer.get_i64()?;
            let size   = buffer.get_i32()?;
            tiles.push((offset, size));
        }

        Ok(TdfDataset {
            attributes: attributes,
            tile_width: tile_width,
            tiles     : tiles,
        })
    }

    pub fn get_group(&self, name: &str) -> Result<TdfGroup> {
        let &(offset, size) = self
            .groups
            .get(name)
            .ok_or_else(|| BigFileError::NoSuchElement(name.to_string()))?;

        let mut buffer = self.factory.fetch(offset, size)?;

        let mut attributes = HashMap::new();
        for _ in 0..buffer.get_i32()?.max(0) {
            let key   = buffer.get_cstring()?;
            let value = buffer.get_cstring()?;
            attributes.insert(key, value);
        }
        Ok(TdfGroup { attributes: attributes })
    }

    // All tiles whose range overlaps the query; absent tiles (negative
    // offset) are skipped
    pub fn query(&self, dataset: &TdfDataset, start_offset: i32, end_offset: i32) -> Result<Vec<TdfTile>> {
        let mut result = Vec::new();

        if dataset.tile_width <= 0 || start_offset >= end_offset || dataset.tiles.is_empty() {
            return Ok(result);
        }

        let first = (start_offset.max(0) / dataset.tile_width) as usize;
        let last  = ((end_offset - 1).max(0) / dataset.tile_width) as usize;

        for i in first..=last.min(dataset.tiles.len() - 1) {
            let (offset, size) = dataset.tiles[i];
            if offset < 0 || size <= 0 {
                continue;
            }
            let mut buffer = if self.header.compressed() {
                self.factory.decompress(offset as u64, size as usize, Compression::Deflate)?
            } else {
                self.factory.fetch(offset as u64, size as usize)?
            };
            result.push(decode_tile(&mut buffer, self.header.track_names.len().max(1))?);
        }
        Ok(result)
    }

    // Per-track values of the zoomed dataset, filtered to the query;
    // falls back to the raw dataset when the zoom level is absent
    pub fn summarize(
        &self,
        chrom: &str,
        start: i32,
        end  : i32,
        zoom : i32,
    ) -> Result<impl Iterator<Item = (i32, i32, Vec<f32>)>> {

        let window_function = self
            .header
            .window_functions
            .first()
            .map(|wf| wf.as_str())
            .unwrap_or("mean")
            .to_string();

        let dataset = match self.get_dataset(&format!("/{}/z{}/{}", chrom, zoom, window_function)) {
            Ok(dataset)                          => dataset,
            Err(BigFileError::NoSuchElement(_))  => self.get_dataset(&format!("/{}/raw", chrom))?,
            Err(err)                             => return Err(err),
        };

        let tiles = self.query(&dataset, start, end)?;

        Ok(tiles.into_iter().flat_map(move |tile| {
            let bins = tile.len();
            (0..bins).filter_map(move |i| {
                let s = tile.start(i);
                let e = tile.end(i);
                if s < end && e > start {
                    let values = (0..tile.track_count()).map(|t| tile.value(t, i)).collect();
                    Some((s, e, values))
                } else {
                    None
                }
            })
        }))
    }

    pub fn duplicate(&self) -> Result<TdfFile> {
        Ok(TdfFile {
            factory : self.factory.duplicate()?,
            header  : self.header.clone(),
            datasets: self.datasets.clone(),
            groups  : self.groups.clone(),
        })
    }

    pub fn close(self) {}

}
