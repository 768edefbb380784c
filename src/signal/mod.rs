//! Sensor signal pipeline
//!
//! Force-sensitive resistors respond non-linearly to pressure. Raw ADC readings
//! are corrected with the polynomial
//!
//! ```text
//! f(v) = (v⁴ / max³) · 0.9 + v · 0.1        v ∈ [0, max]
//! ```
//!
//! and then scaled to `[0, 1]`. The inverse has no closed form, so both
//! directions are precomputed once into a [`LinearizationTable`] that is shared
//! (behind an `Arc`) by every component that converts between raw and unit
//! values.
//!
//! ```text
//! inbound:   raw ──► linearize ──► normalize ──► [0, 1]
//! outbound:  [0, 1] ──► denormalize ──► delinearize ──► raw
//! ```

use std::collections::HashMap;

/// Default full-scale reading of the pad's 10-bit ADC.
pub const DEFAULT_MAX_SENSOR_VALUE: u16 = 1023;

/// Fixed-point precision of the exact inverse lookup.
const EXACT_KEY_SCALE: f64 = 10_000.0;

/// Expands `button_bits` into one flag per button, bit `i` being button `i`.
/// No debouncing happens here; the firmware applies thresholds itself.
pub fn decode_buttons(button_bits: u16, button_count: usize) -> Vec<bool> {
    (0..button_count)
        .map(|i| i < 16 && (button_bits >> i) & 1 == 1)
        .collect()
}

/// Precomputed forward and inverse sensor correction.
#[derive(Debug, Clone)]
pub struct LinearizationTable {
    max_value: u16,
    /// `forward[raw]` is the linearized value of `raw`.
    forward: Vec<f64>,
    /// Linearized value in fixed point → raw value that produced it.
    exact: HashMap<i64, u16>,
    /// `floor_start[k]` is the smallest raw value whose linearized value is `>= k`,
    /// or `max + 1` when there is none. One extra slot closes the last bucket.
    floor_start: Vec<usize>,
}

impl LinearizationTable {
    pub fn new(max_value: u16) -> Self {
        let max = max_value as usize;
        let max_f = max_value.max(1) as f64;

        let mut forward = Vec::with_capacity(max + 1);
        let mut exact = HashMap::with_capacity(max + 1);
        for raw in 0..=max_value {
            let v = raw as f64;
            let linearized = (v.powi(4) / max_f.powi(3)) * 0.9 + v * 0.1;
            forward.push(linearized);
            exact.entry(exact_key(linearized)).or_insert(raw);
        }

        let mut floor_start = Vec::with_capacity(max + 2);
        let mut raw = 0usize;
        for k in 0..=max + 1 {
            while raw <= max && forward[raw] < k as f64 {
                raw += 1;
            }
            floor_start.push(raw);
        }

        Self {
            max_value,
            forward,
            exact,
            floor_start,
        }
    }

    pub fn max_value(&self) -> u16 {
        self.max_value
    }

    /// Corrected value of a raw reading, in raw units. Readings above the
    /// table's range are clamped.
    pub fn linearize(&self, raw: u16) -> f64 {
        let index = raw.min(self.max_value) as usize;
        self.forward[index]
    }

    /// Raw reading whose corrected value is nearest to `value`.
    pub fn delinearize(&self, value: f64) -> u16 {
        let max = self.max_value as f64;
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, max) };

        if let Some(raw) = self.exact.get(&exact_key(value)) {
            return *raw;
        }

        let bucket = value.floor() as usize;
        let low = self.floor_start[bucket].saturating_sub(1);
        let high = self.floor_start[bucket + 1].min(self.max_value as usize);

        let mut best = low;
        let mut best_distance = f64::INFINITY;
        for raw in low..=high {
            let distance = (self.forward[raw] - value).abs();
            if distance < best_distance {
                best = raw;
                best_distance = distance;
            }
        }
        // bounded by max_value
        best as u16
    }

    pub fn normalize(&self, value: f64) -> f64 {
        value / self.max_value.max(1) as f64
    }

    pub fn denormalize(&self, unit: f64) -> f64 {
        (unit * self.max_value as f64).floor()
    }

    /// raw → linearize → normalize.
    pub fn raw_to_unit(&self, raw: u16) -> f64 {
        self.normalize(self.linearize(raw))
    }

    /// unit → denormalize → delinearize.
    pub fn unit_to_raw(&self, unit: f64) -> u16 {
        self.delinearize(self.denormalize(unit))
    }
}

impl Default for LinearizationTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SENSOR_VALUE)
    }
}

fn exact_key(value: f64) -> i64 {
    (value * EXACT_KEY_SCALE).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn buttons_follow_bit_positions() {
        assert_eq!(
            decode_buttons(0b1000_0000_0000_0101, 16)
                .iter()
                .enumerate()
                .filter(|(_, pressed)| **pressed)
                .map(|(i, _)| i)
                .collect::<Vec<_>>(),
            vec![0, 2, 15]
        );
        assert_eq!(decode_buttons(0b11, 2), vec![true, true]);
        assert_eq!(decode_buttons(0b100, 2), vec![false, false]);
    }

    #[test]
    fn forward_curve_hits_both_ends() {
        let table = LinearizationTable::default();

        assert_eq!(table.linearize(0), 0.0);
        assert!((table.linearize(1023) - 1023.0).abs() < 1e-9);
        assert!(table.linearize(512) < 512.0);
        assert_eq!(table.linearize(5000), table.linearize(1023));
    }

    #[test]
    fn forward_curve_is_monotonic() {
        let table = LinearizationTable::default();
        for raw in 1..=1023 {
            assert!(table.linearize(raw) > table.linearize(raw - 1));
        }
    }

    #[test]
    fn every_raw_value_inverts_within_one_unit() {
        let table = LinearizationTable::default();
        for raw in 0..=1023u16 {
            let back = table.delinearize(table.linearize(raw));
            assert!(
                back.abs_diff(raw) <= 1,
                "raw {raw} came back as {back}"
            );
        }
    }

    #[test]
    fn delinearize_picks_nearest_value_between_samples() {
        let table = LinearizationTable::default();
        let a = table.linearize(900);
        let b = table.linearize(901);

        assert_eq!(table.delinearize(a + (b - a) * 0.2), 900);
        assert_eq!(table.delinearize(a + (b - a) * 0.8), 901);
        assert_eq!(table.delinearize(-4.0), 0);
        assert_eq!(table.delinearize(f64::NAN), 0);
        assert_eq!(table.delinearize(2000.0), 1023);
    }

    #[test]
    fn normalization_maps_to_unit_range() {
        let table = LinearizationTable::default();

        assert_eq!(table.raw_to_unit(0), 0.0);
        assert!((table.raw_to_unit(1023) - 1.0).abs() < 1e-9);
        assert_eq!(table.denormalize(0.5), 511.0);
        assert_eq!(table.unit_to_raw(1.0), 1023);
        assert_eq!(table.unit_to_raw(0.0), 0);
    }

    #[test]
    fn full_range_table_inverts_at_the_top() {
        let table = LinearizationTable::new(u16::MAX);

        assert_eq!(table.delinearize(table.linearize(u16::MAX)), u16::MAX);
        assert_eq!(table.delinearize(f64::from(u16::MAX) - 0.5), u16::MAX);
        assert_eq!(table.unit_to_raw(1.0), u16::MAX);
        let mid = table.linearize(40_000);
        assert_eq!(table.delinearize(mid + 0.1), 40_000);
    }

    proptest! {
        #[test]
        fn prop_unit_round_trip_is_close(raw in 0u16..=1023) {
            let table = LinearizationTable::default();
            let unit = table.raw_to_unit(raw);
            let back = table.raw_to_unit(table.unit_to_raw(unit));
            // flooring costs up to one linearized unit, the nearest match up to one more
            prop_assert!((back - unit).abs() <= 3.0 / 1023.0);
        }

        #[test]
        fn prop_small_tables_invert(max in 1u16..64, raw in 0u16..64) {
            let table = LinearizationTable::new(max);
            let raw = raw.min(max);
            prop_assert!(table.delinearize(table.linearize(raw)).abs_diff(raw) <= 1);
        }
    }
}
