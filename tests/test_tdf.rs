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

/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {

    use std::io::Write;

    use byteorder::{LittleEndian, WriteBytesExt};
    use flate2::write::ZlibEncoder;

    use bigtracks::error::BigFileError;
    use bigtracks::tdf::{TdfFile, TdfTile};

    fn put_cstring(buffer: &mut Vec<u8>, value: &str) {
        buffer.extend_from_slice(value.as_bytes());
        buffer.push(0);
    }

    // Builds a two-track TDF file with one fixed step tile and two
    // absent tiles
    fn tdf_fixture() -> tempfile::NamedTempFile {

        // variable header block
        let mut var = Vec::new();
        var.write_i32::<LittleEndian>(1).unwrap();
        put_cstring(&mut var, "mean");
        put_cstring(&mut var, "OTHER");
        put_cstring(&mut var, "");
        var.write_i32::<LittleEndian>(2).unwrap();
        put_cstring(&mut var, "track1");
        put_cstring(&mut var, "track2");
        put_cstring(&mut var, "hg19");
        var.write_i32::<LittleEndian>(1).unwrap(); // flags: compressed tiles

        // fixed step tile, two tracks of four bins
        let mut tile = Vec::new();
        put_cstring(&mut tile, "fixedStep");
        tile.write_i32::<LittleEndian>(4).unwrap();
        tile.write_i32::<LittleEndian>(0).unwrap();
        tile.write_f32::<LittleEndian>(250.0).unwrap();
        for value in [1.0f32, 2.0, 3.0, 4.0] {
            tile.write_f32::<LittleEndian>(value).unwrap();
        }
        for value in [10.0f32, 20.0, 30.0, 40.0] {
            tile.write_f32::<LittleEndian>(value).unwrap();
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        encoder.write_all(&tile).unwrap();
        let tile = encoder.finish().unwrap();

        let tile_offset = 24 + var.len();

        // dataset blob pointing at the tile table
        let mut dataset = Vec::new();
        dataset.write_i32::<LittleEndian>(1).unwrap();
        put_cstring(&mut dataset, "chrLength");
        put_cstring(&mut dataset, "10000");
        put_cstring(&mut dataset, "float");
        dataset.write_f32::<LittleEndian>(1000.0).unwrap();
        dataset.write_i32::<LittleEndian>(3).unwrap();
        dataset.write_i64::<LittleEndian>(tile_offset as i64).unwrap();
        dataset.write_i32::<LittleEndian>(tile.len() as i32).unwrap();
        for _ in 0..2 {
            dataset.write_i64::<LittleEndian>(-1).unwrap();
            dataset.write_i32::<LittleEndian>(0).unwrap();
        }

        // group blob
        let mut group = Vec::new();
        group.write_i32::<LittleEndian>(1).unwrap();
        put_cstring(&mut group, "genome");
        put_cstring(&mut group, "hg19");

        let dataset_offset = tile_offset + tile.len();
        let group_offset   = dataset_offset + dataset.len();
        let index_offset   = group_offset + group.len();

        // master index
        let mut index = Vec::new();
        index.write_i32::<LittleEndian>(1).unwrap();
        put_cstring(&mut index, "/chr1/raw");
        index.write_i64::<LittleEndian>(dataset_offset as i64).unwrap();
        index.write_i32::<LittleEndian>(dataset.len() as i32).unwrap();
        index.write_i32::<LittleEndian>(1).unwrap();
        put_cstring(&mut index, "/");
        index.write_i64::<LittleEndian>(group_offset as i64).unwrap();
        index.write_i32::<LittleEndian>(group.len() as i32).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"TDF4");
        bytes.write_i32::<LittleEndian>(4).unwrap();
        bytes.write_i64::<LittleEndian>(index_offset as i64).unwrap();
        bytes.write_i32::<LittleEndian>(index.len() as i32).unwrap();
        bytes.write_i32::<LittleEndian>(var.len() as i32).unwrap();
        bytes.extend_from_slice(&var);
        bytes.extend_from_slice(&tile);
        bytes.extend_from_slice(&dataset);
        bytes.extend_from_slice(&group);
        bytes.extend_from_slice(&index);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn tdf_header() {

        let file = tdf_fixture();
        let tdf  = TdfFile::open(file.path()).unwrap();

        assert_eq!(tdf.version(), 4);
        assert_eq!(tdf.window_functions(), ["mean"]);
        assert_eq!(tdf.track_names(), ["track1", "track2"]);
        assert!(tdf.header().compressed());
        assert_eq!(tdf.header().build, "hg19");
    }

    #[test]
    fn tdf_query_fixed_tile() {

        let file = tdf_fixture();
        let tdf  = TdfFile::open(file.path()).unwrap();

        let dataset = tdf.get_dataset("/chr1/raw").unwrap();

        assert_eq!(dataset.tile_width, 1000);
        assert_eq!(dataset.tiles.len(), 3);
        assert_eq!(dataset.attributes.get("chrLength").map(|v| v.as_str()), Some("10000"));

        let tiles = tdf.query(&dataset, 0, 1000).unwrap();

        assert_eq!(tiles.len(), 1);
        let tile = &tiles[0];
        assert_eq!(tile.len(), 4);
        assert_eq!(tile.track_count(), 2);
        assert_eq!(tile.start(0), 0);
        assert_eq!(tile.end(0), 250);
        assert_eq!(tile.value(0, 2),  3.0);
        assert_eq!(tile.value(1, 2), 30.0);

        match tile {
            TdfTile::Fixed { start, span, .. } => {
                assert_eq!(*start, 0);
                assert_eq!(*span, 250.0);
            }
            _ => panic!("expected a fixed step tile"),
        }
    }

    #[test]
    fn tdf_absent_tiles_yield_empty_result() {

        let file = tdf_fixture();
        let tdf  = TdfFile::open(file.path()).unwrap();

        let dataset = tdf.get_dataset("/chr1/raw").unwrap();

        // both tiles in [1000, 3000) are absent
        let tiles = tdf.query(&dataset, 1000, 3000).unwrap();
        assert!(tiles.is_empty());

        let tiles = tdf.query(&dataset, 0, 3000).unwrap();
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn tdf_summarize_falls_back_to_raw() {

        let file = tdf_fixture();
        let tdf  = TdfFile::open(file.path()).unwrap();

        // no zoom datasets exist, so /chr1/raw is used
        let bins: Vec<(i32, i32, Vec<f32>)> = tdf.summarize("chr1", 0, 600, 0).unwrap().collect();

        assert_eq!(bins, vec![
            (  0,  250, vec![1.0, 10.0]),
            (250,  500, vec![2.0, 20.0]),
            (500,  750, vec![3.0, 30.0]),
        ]);
    }

    #[test]
    fn tdf_groups_and_missing_names() {

        let file = tdf_fixture();
        let tdf  = TdfFile::open(file.path()).unwrap();

        let group = tdf.get_group("/").unwrap();
        assert_eq!(group.attributes.get("genome").map(|v| v.as_str()), Some("hg19"));

        assert!(matches!(
            tdf.get_dataset("/chrX/raw"),
            Err(BigFileError::NoSuchElement(_))
        ));
        assert!(matches!(
            tdf.get_group("/missing"),
            Err(BigFileError::NoSuchElement(_))
        ));
    }
}
