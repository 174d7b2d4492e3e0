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

    use approx::assert_relative_eq;
    use byteordered::Endianness;

    use bigtracks::bbi::{PREFETCH_LEVEL_DETAILED, PREFETCH_LEVEL_OFF};
    use bigtracks::bigwig::{BigWigFile, OptionBigWig, WigSection};
    use bigtracks::error::BigFileError;
    use bigtracks::rom_buffer::Compression;
    use bigtracks::rom_factory::RomFactoryKind;

    fn chrom_sizes() -> Vec<(String, u32)> {
        vec![
            ("chr1".to_string(), 10000),
            ("chr2".to_string(), 20000),
        ]
    }

    fn fixed_section() -> WigSection {
        WigSection::FixedStep {
            chrom : "chr1".to_string(),
            start : 100,
            step  : 10,
            span  : 5,
            values: vec![1.0, 2.0, 3.0, 4.0],
        }
    }

    #[test]
    fn bigwig_query_overlapping() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(
            &[fixed_section()],
            &chrom_sizes(),
            file.path(),
            vec![OptionBigWig::Compression(Compression::Snappy)],
        )
        .unwrap();

        let mut bw = BigWigFile::open(file.path()).unwrap();

        assert_eq!(bw.header().version, 5);

        // records at 100, 110, 120 overlap [105, 125)
        let sections: Vec<WigSection> = bw
            .query("chr1", 105, 125, true)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(sections.len(), 1);
        assert_eq!(
            sections[0],
            WigSection::FixedStep {
                chrom : "chr1".to_string(),
                start : 100,
                step  : 10,
                span  : 5,
                values: vec![1.0, 2.0, 3.0],
            }
        );
    }

    #[test]
    fn bigwig_query_contained() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(
            &[fixed_section()],
            &chrom_sizes(),
            file.path(),
            vec![OptionBigWig::Compression(Compression::Snappy)],
        )
        .unwrap();

        let mut bw = BigWigFile::open(file.path()).unwrap();

        // only the record at 110 is fully contained in [105, 125)
        let sections: Vec<WigSection> = bw
            .query("chr1", 105, 125, false)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(sections.len(), 1);
        assert_eq!(
            sections[0],
            WigSection::FixedStep {
                chrom : "chr1".to_string(),
                start : 110,
                step  : 10,
                span  : 5,
                values: vec![2.0],
            }
        );
    }

    fn mixed_sections() -> Vec<WigSection> {
        vec![
            WigSection::FixedStep {
                chrom : "chr1".to_string(),
                start : 0,
                step  : 100,
                span  : 100,
                values: vec![0.5, 1.5, 2.5],
            },
            WigSection::VariableStep {
                chrom    : "chr1".to_string(),
                span     : 20,
                positions: vec![400, 500, 700],
                values   : vec![4.0, 5.0, 7.0],
            },
            WigSection::BedGraph {
                chrom : "chr2".to_string(),
                starts: vec![0, 250],
                ends  : vec![100, 300],
                values: vec![-1.0, 9.0],
            },
        ]
    }

    #[test]
    fn bigwig_round_trip() {

        for compression in [Compression::None, Compression::Deflate, Compression::Snappy] {

            let file = tempfile::NamedTempFile::new().unwrap();

            BigWigFile::write(
                &mixed_sections(),
                &chrom_sizes(),
                file.path(),
                vec![OptionBigWig::Compression(compression)],
            )
            .unwrap();

            let mut bw = BigWigFile::open(file.path()).unwrap();

            let chromosomes: Vec<(String, u32)> = bw
                .chromosomes()
                .map(|(name, length)| (name.to_string(), length))
                .collect();
            assert_eq!(chromosomes, vec![
                ("chr1".to_string(), 10000),
                ("chr2".to_string(), 20000),
            ]);

            let mut sections: Vec<WigSection> = bw
                .query("chr1", 0, 10000, true)
                .collect::<Result<_, _>>()
                .unwrap();
            let chr2: Vec<WigSection> = bw
                .query("chr2", 0, 20000, true)
                .collect::<Result<_, _>>()
                .unwrap();
            sections.extend(chr2);

            assert_eq!(sections, mixed_sections());
        }
    }

    #[test]
    fn bigwig_byte_order_invariance() {

        let file_le = tempfile::NamedTempFile::new().unwrap();
        let file_be = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(
            &mixed_sections(),
            &chrom_sizes(),
            file_le.path(),
            vec![OptionBigWig::ByteOrder(Endianness::Little)],
        )
        .unwrap();
        BigWigFile::write(
            &mixed_sections(),
            &chrom_sizes(),
            file_be.path(),
            vec![OptionBigWig::ByteOrder(Endianness::Big)],
        )
        .unwrap();

        let mut le = BigWigFile::open(file_le.path()).unwrap();
        let mut be = BigWigFile::open(file_be.path()).unwrap();

        let from_le: Vec<WigSection> = le.query("chr1", 0, 10000, true).collect::<Result<_, _>>().unwrap();
        let from_be: Vec<WigSection> = be.query("chr1", 0, 10000, true).collect::<Result<_, _>>().unwrap();

        assert_eq!(from_le, from_be);
        assert_eq!(from_le.len(), 2);
    }

    #[test]
    fn bigwig_factory_equivalence() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(&mixed_sections(), &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut results = Vec::new();
        for kind in [
            RomFactoryKind::Synchronized,
            RomFactoryKind::PerCursor,
            RomFactoryKind::ThreadSafe,
            RomFactoryKind::MemoryMapped,
        ] {
            for prefetch in [PREFETCH_LEVEL_OFF, PREFETCH_LEVEL_DETAILED] {
                let mut bw = BigWigFile::open_with(file.path(), kind, prefetch).unwrap();
                let sections: Vec<WigSection> = bw
                    .query("chr1", 0, 10000, true)
                    .collect::<Result<_, _>>()
                    .unwrap();
                results.push(sections);
            }
        }
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
    }

    #[test]
    fn bigwig_summarize_constant() {

        let file = tempfile::NamedTempFile::new().unwrap();

        // 1000 bases of constant 2.0
        let section = WigSection::FixedStep {
            chrom : "chr1".to_string(),
            start : 0,
            step  : 1,
            span  : 1,
            values: vec![2.0; 1000],
        };

        BigWigFile::write(&[section], &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bw = BigWigFile::open(file.path()).unwrap();

        assert!(bw.zoom_levels().len() > 0);

        let bins = bw.summarize("chr1", 0, 1000, 4).unwrap();

        assert_eq!(bins.len(), 4);
        for bin in &bins {
            assert_eq!(bin.count, 250);
            assert_relative_eq!(bin.sum, 500.0, epsilon = 1e-3);
            assert_relative_eq!(bin.min, 2.0);
            assert_relative_eq!(bin.max, 2.0);
        }

        // refining the bins preserves the totals
        let one = bw.summarize("chr1", 0, 1000, 1).unwrap();
        assert_eq!(one[0].count, 1000);
        assert_relative_eq!(one[0].sum, 2000.0, epsilon = 1e-2);

        let total = bw.total_summary();
        assert_eq!(total.count, 1000);
        assert_relative_eq!(total.sum, 2000.0);
        assert_relative_eq!(total.min, 2.0);
        assert_relative_eq!(total.max, 2.0);
    }

    #[test]
    fn bigwig_summarize_raw() {

        let file = tempfile::NamedTempFile::new().unwrap();

        let section = WigSection::BedGraph {
            chrom : "chr1".to_string(),
            starts: vec![0, 4],
            ends  : vec![4, 8],
            values: vec![1.0, 3.0],
        };

        BigWigFile::write(&[section], &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bw = BigWigFile::open(file.path()).unwrap();

        // the range is too small for any zoom level
        let bins = bw.summarize("chr1", 0, 8, 2).unwrap();

        assert_eq!(bins[0].count, 4);
        assert_relative_eq!(bins[0].sum, 4.0);
        assert_eq!(bins[1].count, 4);
        assert_relative_eq!(bins[1].sum, 12.0);
    }

    #[test]
    fn bigwig_overlap_completeness() {

        use rand::{Rng, SeedableRng};

        let file = tempfile::NamedTempFile::new().unwrap();

        // non-overlapping variable step records
        let positions: Vec<u32> = (0..500).map(|i| i * 13).collect();
        let values   : Vec<f32> = (0..500).map(|i| i as f32).collect();
        let section = WigSection::VariableStep {
            chrom    : "chr1".to_string(),
            span     : 10,
            positions: positions.clone(),
            values   : values.clone(),
        };

        BigWigFile::write(&[section], &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bw  = BigWigFile::open(file.path()).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(31);

        for _ in 0..50 {
            let start = rng.gen_range(0..7000);
            let end   = start + rng.gen_range(1..1000);

            let expected: Vec<(u32, f32)> = positions
                .iter()
                .zip(values.iter())
                .filter(|(&p, _)| p < end && p + 10 > start)
                .map(|(&p, &v)| (p, v))
                .collect();

            let mut observed = Vec::new();
            for section in bw.query("chr1", start, end, true) {
                if let WigSection::VariableStep { positions, values, .. } = section.unwrap() {
                    observed.extend(positions.into_iter().zip(values.into_iter()));
                }
            }
            assert_eq!(observed, expected, "query [{}, {})", start, end);
        }
    }

    #[test]
    fn bigwig_unknown_chromosome() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(&[fixed_section()], &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bw = BigWigFile::open(file.path()).unwrap();

        let results: Vec<_> = bw.query("chr3", 0, 100, true).collect();

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(BigFileError::NoSuchElement(_))));
    }

    #[test]
    fn bigwig_duplicate_reader() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigWigFile::write(&mixed_sections(), &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bw    = BigWigFile::open(file.path()).unwrap();
        let mut other = bw.duplicate().unwrap();

        let a: Vec<WigSection> = bw.query("chr1", 0, 10000, true).collect::<Result<_, _>>().unwrap();
        let b: Vec<WigSection> = other.query("chr1", 0, 10000, true).collect::<Result<_, _>>().unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn bigwig_rejects_unsorted_input() {

        let file = tempfile::NamedTempFile::new().unwrap();

        let sections = vec![
            WigSection::BedGraph {
                chrom : "chr1".to_string(),
                starts: vec![100],
                ends  : vec![200],
                values: vec![1.0],
            },
            WigSection::BedGraph {
                chrom : "chr1".to_string(),
                starts: vec![150],
                ends  : vec![250],
                values: vec![2.0],
            },
        ];

        let result = BigWigFile::write(&sections, &chrom_sizes(), file.path(), vec![]);

        assert!(matches!(result, Err(BigFileError::SortOrder(_))));
    }
}
