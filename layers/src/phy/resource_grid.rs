//! Sidelink subframe resource mapping
//!
//! V2X sidelink subframes (TS 36.211 Section 9.8) carry DMRS on symbols
//! 2, 5, 8 and 11; the last symbol is a guard period. Control and data
//! symbols are mapped frequency first over the allocated PRBs on the
//! remaining nine symbols.
//!
//! Synchronisation subframes keep the DMRS positions. Their data symbols are
//! shared between the primary (PSSS) and secondary (SSSS) sync signals and
//! the broadcast channel.

use crate::LayerError;
use common::types::SUBCARRIERS_PER_PRB;
use interfaces::SubframeGrid;
use num_complex::Complex32;
use std::ops::Range;

/// Symbols carrying demodulation reference signals
pub const DMRS_SYMBOLS: [usize; 4] = [2, 5, 8, 11];

/// Symbols carrying PSCCH/PSSCH modulation symbols
pub const DATA_SYMBOLS: [usize; 9] = [0, 1, 3, 4, 6, 7, 9, 10, 12];

/// Data symbols of a sync subframe carrying the PSSS
pub const PSSS_SYMBOLS: [usize; 2] = [0, 1];

/// Data symbols of a sync subframe carrying the SSSS
pub const SSSS_SYMBOLS: [usize; 2] = [9, 10];

/// Data symbols of a sync subframe carrying the PSBCH
pub const PSBCH_SYMBOLS: [usize; 5] = [3, 4, 6, 7, 12];

/// Data resource elements over `n_prb` resource blocks
pub const fn nof_data_re(n_prb: usize) -> usize {
    n_prb * SUBCARRIERS_PER_PRB * DATA_SYMBOLS.len()
}

/// PSBCH resource elements over `n_prb` resource blocks
pub const fn nof_psbch_re(n_prb: usize) -> usize {
    n_prb * SUBCARRIERS_PER_PRB * PSBCH_SYMBOLS.len()
}

/// Reference signal resource elements over `n_prb` resource blocks
pub const fn nof_dmrs_re(n_prb: usize) -> usize {
    n_prb * SUBCARRIERS_PER_PRB * DMRS_SYMBOLS.len()
}

/// Subcarrier range of a PRB range, checked against the grid
fn subcarriers(grid: &SubframeGrid, prbs: &Range<u32>) -> Result<Range<usize>, LayerError> {
    if prbs.start >= prbs.end || prbs.end as usize > grid.nof_prb() {
        return Err(LayerError::ProcessingError(format!(
            "PRB range {:?} outside carrier of {} PRBs",
            prbs,
            grid.nof_prb()
        )));
    }
    Ok(prbs.start as usize * SUBCARRIERS_PER_PRB..prbs.end as usize * SUBCARRIERS_PER_PRB)
}

fn map_symbols(
    grid: &mut SubframeGrid,
    prbs: &Range<u32>,
    symbol_set: &[usize],
    values: &[Complex32],
) -> Result<(), LayerError> {
    let sc = subcarriers(grid, prbs)?;
    if values.len() != sc.len() * symbol_set.len() {
        return Err(LayerError::ProcessingError(format!(
            "{} symbols for {} resource elements",
            values.len(),
            sc.len() * symbol_set.len()
        )));
    }

    let mut it = values.iter();
    for &l in symbol_set {
        for k in sc.clone() {
            if let Some(&v) = it.next() {
                grid.set(k, l, v);
            }
        }
    }
    Ok(())
}

fn extract_symbols(
    grid: &SubframeGrid,
    prbs: &Range<u32>,
    symbol_set: &[usize],
) -> Result<Vec<Complex32>, LayerError> {
    let sc = subcarriers(grid, prbs)?;
    let mut out = Vec::with_capacity(sc.len() * symbol_set.len());
    for &l in symbol_set {
        out.extend(grid.symbol_slice(l, sc.start, sc.len()).iter().copied());
    }
    Ok(out)
}

/// Map modulation symbols onto the data resource elements of `prbs`
pub fn map_data(grid: &mut SubframeGrid, prbs: &Range<u32>, symbols: &[Complex32]) -> Result<(), LayerError> {
    map_symbols(grid, prbs, &DATA_SYMBOLS, symbols)
}

/// Read the data resource elements of `prbs`
pub fn extract_data(grid: &SubframeGrid, prbs: &Range<u32>) -> Result<Vec<Complex32>, LayerError> {
    extract_symbols(grid, prbs, &DATA_SYMBOLS)
}

/// Map modulation symbols onto the PSBCH resource elements of `prbs`
pub fn map_psbch(grid: &mut SubframeGrid, prbs: &Range<u32>, symbols: &[Complex32]) -> Result<(), LayerError> {
    map_symbols(grid, prbs, &PSBCH_SYMBOLS, symbols)
}

/// Read the PSBCH resource elements of `prbs`
pub fn extract_psbch(grid: &SubframeGrid, prbs: &Range<u32>) -> Result<Vec<Complex32>, LayerError> {
    extract_symbols(grid, prbs, &PSBCH_SYMBOLS)
}

/// Map pilots onto the DMRS resource elements of `prbs`
pub fn map_dmrs(grid: &mut SubframeGrid, prbs: &Range<u32>, pilots: &[Complex32]) -> Result<(), LayerError> {
    map_symbols(grid, prbs, &DMRS_SYMBOLS, pilots)
}

/// Read the DMRS resource elements of `prbs`
pub fn extract_dmrs(grid: &SubframeGrid, prbs: &Range<u32>) -> Result<Vec<Complex32>, LayerError> {
    extract_symbols(grid, prbs, &DMRS_SYMBOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_counts() {
        assert_eq!(nof_data_re(8), 864);
        assert_eq!(nof_dmrs_re(2), 96);
        let mut all: Vec<usize> = DATA_SYMBOLS.iter().chain(DMRS_SYMBOLS.iter()).copied().collect();
        all.sort();
        assert_eq!(all, (0..13).collect::<Vec<_>>());

        let mut sync: Vec<usize> = PSSS_SYMBOLS
            .iter()
            .chain(SSSS_SYMBOLS.iter())
            .chain(PSBCH_SYMBOLS.iter())
            .copied()
            .collect();
        sync.sort();
        assert_eq!(sync, DATA_SYMBOLS.to_vec());
        assert_eq!(nof_psbch_re(6), 360);
    }

    #[test]
    fn test_map_extract_data() {
        let mut grid = SubframeGrid::new(6, 0);
        let prbs = 1..3;
        let values: Vec<Complex32> = (0..nof_data_re(2)).map(|i| Complex32::new(i as f32, 0.0)).collect();
        map_data(&mut grid, &prbs, &values).unwrap();

        // Frequency first: second value sits on the next subcarrier of symbol 0
        assert_eq!(grid.get(13, 0), Complex32::new(1.0, 0.0));
        assert_eq!(grid.get(12, 1), Complex32::new(24.0, 0.0));
        assert_eq!(extract_data(&grid, &prbs).unwrap(), values);
        assert!(extract_dmrs(&grid, &prbs).unwrap().iter().all(|v| v.norm() == 0.0));
    }

    #[test]
    fn test_range_checks() {
        let mut grid = SubframeGrid::new(6, 0);
        assert!(extract_data(&grid, &(5..7)).is_err());
        assert!(map_dmrs(&mut grid, &(0..1), &[Complex32::new(1.0, 0.0)]).is_err());
    }
}
