//! Largest remainder apportionment of fractional trades into whole blocks.

/// Round `values` to integers whose sum is exactly `round(sum(values))`
/// (ties to even), moving each entry by less than one.
///
/// Every entry is floored; the shortfall is handed out one unit at a time to
/// the largest fractional remainders. Equal remainders go to the earlier index.
/// Works the same for negative entries (a seller's net position).
pub fn largest_remainder(values: &[f64]) -> Vec<i64> {
    if values.is_empty() {
        return Vec::new();
    }

    let target = values.iter().sum::<f64>().round_ties_even() as i64;
    let mut allotted: Vec<i64> = values.iter().map(|v| v.floor() as i64).collect();

    let mut remainders: Vec<(f64, usize)> = values
        .iter()
        .enumerate()
        .map(|(index, v)| (v - v.floor(), index))
        .collect();
    // Stable: ties keep ascending index order
    remainders.sort_by(|a, b| b.0.total_cmp(&a.0));

    let deficit = target - allotted.iter().sum::<i64>();
    for &(_, index) in remainders.iter().take(deficit.max(0) as usize) {
        allotted[index] += 1;
    }

    allotted
}
