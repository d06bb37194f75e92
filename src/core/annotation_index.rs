//! Image pixel to instrument scan/pixel number resolution
//!
//! Step 1 of the instrument pixel coordinate methodology: every image pixel
//! is traced back to the instrument scan and pixel that produced it through
//! the per-view scan/pixel number annotation records.

use crate::types::{AdsGroup, UngridError, UngridResult, GRANULE_ROWS};

/// Scan and pixel numbers of one 32-row granule, one entry per image column
#[derive(Debug, Clone)]
pub struct ScanNumberGranule {
    pub scan_numbers: Vec<i32>,
    pub pixel_numbers: Vec<i32>,
}

/// Instrument coordinate of an image pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPixelIndex {
    pub scan: i32,
    pub pixel: i32,
}

/// Typed copy of a `*_VIEW_SCAN_PIX_NUM_ADS` group
#[derive(Debug, Clone)]
pub struct ScanNumberTable {
    granules: Vec<ScanNumberGranule>,
}

impl ScanNumberTable {
    pub fn new(granules: Vec<ScanNumberGranule>) -> Self {
        Self { granules }
    }

    /// Extract `instr_scan_num` / `pix_num` from every record of the group
    pub fn from_group(group: &AdsGroup) -> UngridResult<Self> {
        let mut granules = Vec::with_capacity(group.len());

        for (index, record) in group.records.iter().enumerate() {
            let scan_numbers: Vec<i32> = record
                .attribute("instr_scan_num")?
                .iter()
                .map(|&v| v as i32)
                .collect();
            let pixel_numbers: Vec<i32> = record
                .attribute("pix_num")?
                .iter()
                .map(|&v| v as i32)
                .collect();

            if scan_numbers.len() != pixel_numbers.len() {
                return Err(UngridError::Metadata(format!(
                    "{} record {} has {} scan numbers but {} pixel numbers",
                    group.name,
                    index,
                    scan_numbers.len(),
                    pixel_numbers.len()
                )));
            }

            granules.push(ScanNumberGranule {
                scan_numbers,
                pixel_numbers,
            });
        }

        log::debug!("{}: {} granules", group.name, granules.len());
        Ok(Self { granules })
    }

    pub fn granules(&self) -> &[ScanNumberGranule] {
        &self.granules
    }

    /// Image rows covered by the table
    pub fn covered_rows(&self) -> usize {
        self.granules.len() * GRANULE_ROWS
    }

    pub fn resolve(&self, row: usize, col: usize) -> Option<ScanPixelIndex> {
        resolve(row, col, &self.granules)
    }
}

/// Resolve image pixel (`row`, `col`) to its instrument scan and pixel number.
///
/// Rows inside a granule are numbered by their offset from the granule's
/// reference scan. A stored scan number of 0 marks an unmapped pixel and is
/// never offset. Returns `None` when the row or column lies beyond the
/// annotation coverage.
pub fn resolve(row: usize, col: usize, granules: &[ScanNumberGranule]) -> Option<ScanPixelIndex> {
    let granule_index = row / GRANULE_ROWS;
    let offset = row - GRANULE_ROWS * granule_index;

    let granule = granules.get(granule_index)?;
    let mut scan = *granule.scan_numbers.get(col)?;
    let pixel = *granule.pixel_numbers.get(col)?;

    if offset != 0 && scan != 0 {
        scan += offset as i32;
    }

    Some(ScanPixelIndex { scan, pixel })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granule(scan: i32, width: usize) -> ScanNumberGranule {
        ScanNumberGranule {
            scan_numbers: vec![scan; width],
            pixel_numbers: (0..width as i32).map(|p| 200 + p).collect(),
        }
    }

    #[test]
    fn test_first_row_of_granule_is_unmodified() {
        let granules = vec![granule(100, 4), granule(132, 4)];
        for g in 0..2 {
            for col in 0..4 {
                let idx = resolve(32 * g, col, &granules).unwrap();
                assert_eq!(idx.scan, granules[g].scan_numbers[col]);
                assert_eq!(idx.pixel, granules[g].pixel_numbers[col]);
            }
        }
    }

    #[test]
    fn test_mid_granule_rows_are_offset() {
        let granules = vec![granule(100, 3), granule(132, 3)];
        for d in 1..32 {
            for col in 0..3 {
                let idx = resolve(32 + d, col, &granules).unwrap();
                assert_eq!(idx.scan, 132 + d as i32);
            }
        }
    }

    #[test]
    fn test_unmapped_scan_stays_zero() {
        let granules = vec![granule(0, 2)];
        for row in 0..32 {
            assert_eq!(resolve(row, 1, &granules).unwrap().scan, 0);
        }
    }

    #[test]
    fn test_single_granule_offset_example() {
        let mut g = granule(0, 8);
        g.scan_numbers[5] = 40;
        let granules = vec![g];
        assert_eq!(resolve(5, 5, &granules).unwrap().scan, 45);
        assert_eq!(resolve(5, 4, &granules).unwrap().scan, 0);
    }

    #[test]
    fn test_out_of_coverage_returns_none() {
        let granules = vec![granule(64, 2)];
        assert!(resolve(32, 0, &granules).is_none());
        assert!(resolve(0, 2, &granules).is_none());
    }

    #[test]
    fn test_table_from_group() {
        use crate::types::AdsRecord;
        use std::collections::HashMap;

        let mut attributes = HashMap::new();
        attributes.insert("instr_scan_num".to_string(), vec![40.0, 0.0]);
        attributes.insert("pix_num".to_string(), vec![250.0, 251.0]);
        let group = AdsGroup {
            name: "NADIR_VIEW_SCAN_PIX_NUM_ADS".to_string(),
            attributes: HashMap::new(),
            records: vec![AdsRecord { attributes }],
        };

        let table = ScanNumberTable::from_group(&group).unwrap();
        assert_eq!(table.covered_rows(), 32);
        assert_eq!(table.resolve(3, 0), Some(ScanPixelIndex { scan: 43, pixel: 250 }));
        assert_eq!(table.resolve(3, 1), Some(ScanPixelIndex { scan: 0, pixel: 251 }));
    }
}
