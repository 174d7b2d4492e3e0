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

    use bigtracks::bigbed::{BedEntry, BigBedFile, OptionBigBed};
    use bigtracks::error::BigFileError;
    use bigtracks::rom_buffer::Compression;

    fn chrom_sizes() -> Vec<(String, u32)> {
        vec![
            ("chr1".to_string(), 10000),
            ("chrX".to_string(),  5000),
        ]
    }

    fn entries() -> Vec<BedEntry> {
        vec![
            BedEntry {
                chrom: "chr1".to_string(),
                start: 10,
                end  : 20,
                rest : "first\t960\t+".to_string(),
            },
            BedEntry {
                chrom: "chr1".to_string(),
                start: 15,
                end  : 30,
                rest : "second\t850\t-".to_string(),
            },
            BedEntry {
                chrom: "chr1".to_string(),
                start: 25,
                end  : 40,
                rest : "third\t540\t+".to_string(),
            },
            BedEntry {
                chrom: "chrX".to_string(),
                start: 100,
                end  : 200,
                rest : String::new(),
            },
        ]
    }

    #[test]
    fn bigbed_round_trip() {

        for compression in [Compression::None, Compression::Deflate, Compression::Snappy] {

            let file = tempfile::NamedTempFile::new().unwrap();

            BigBedFile::write(
                &entries(),
                &chrom_sizes(),
                file.path(),
                vec![OptionBigBed::Compression(compression)],
            )
            .unwrap();

            let mut bb = BigBedFile::open(file.path()).unwrap();

            let mut observed: Vec<BedEntry> = bb
                .query("chr1", 0, 10000, true)
                .collect::<Result<_, _>>()
                .unwrap();
            let chrx: Vec<BedEntry> = bb
                .query("chrX", 0, 5000, true)
                .collect::<Result<_, _>>()
                .unwrap();
            observed.extend(chrx);

            assert_eq!(observed, entries());

            // field count is derived from the first record
            assert_eq!(bb.header().field_count, 6);
            assert_eq!(bb.header().defined_field_count, 6);
        }
    }

    #[test]
    fn bigbed_query_contained() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigBedFile::write(&entries(), &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bb = BigBedFile::open(file.path()).unwrap();

        // only [15, 30) lies fully inside [12, 32)
        let observed: Vec<BedEntry> = bb
            .query("chr1", 12, 32, false)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].start, 15);
        assert_eq!(observed[0].end  , 30);
        assert_eq!(observed[0].rest , "second\t850\t-");

        // with overlaps all three chr1 records intersect [12, 32)
        let observed: Vec<BedEntry> = bb
            .query("chr1", 12, 32, true)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(observed.len(), 3);
    }

    #[test]
    fn bigbed_summarize_coverage() {

        let file = tempfile::NamedTempFile::new().unwrap();

        let entries = vec![BedEntry {
            chrom: "chr1".to_string(),
            start: 0,
            end  : 1000,
            rest : String::new(),
        }];

        BigBedFile::write(&entries, &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bb = BigBedFile::open(file.path()).unwrap();

        let bins = bb.summarize("chr1", 0, 1000, 4).unwrap();

        assert_eq!(bins.len(), 4);
        for bin in &bins {
            assert_eq!(bin.count, 250);
            assert_relative_eq!(bin.sum, 250.0, epsilon = 1e-3);
            assert_relative_eq!(bin.min, 1.0);
            assert_relative_eq!(bin.max, 1.0);
        }

        let total = bb.total_summary();
        assert_eq!(total.count, 1000);
        assert_relative_eq!(total.sum, 1000.0);
    }

    #[test]
    fn bigbed_unknown_chromosome() {

        let file = tempfile::NamedTempFile::new().unwrap();

        BigBedFile::write(&entries(), &chrom_sizes(), file.path(), vec![]).unwrap();

        let mut bb = BigBedFile::open(file.path()).unwrap();

        let results: Vec<_> = bb.query("chr7", 0, 100, true).collect();

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(BigFileError::NoSuchElement(_))));
    }

    #[test]
    fn bigbed_rejects_interleaved_chromosomes() {

        let file = tempfile::NamedTempFile::new().unwrap();

        let entries = vec![
            BedEntry { chrom: "chr1".to_string(), start: 0,  end: 10, rest: String::new() },
            BedEntry { chrom: "chrX".to_string(), start: 0,  end: 10, rest: String::new() },
            BedEntry { chrom: "chr1".to_string(), start: 20, end: 30, rest: String::new() },
        ];

        let result = BigBedFile::write(&entries, &chrom_sizes(), file.path(), vec![]);

        assert!(matches!(result, Err(BigFileError::SortOrder(_))));
    }
}
