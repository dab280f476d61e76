//! Fixed numeric buckets for the upstream people-count and size tags.
//!
//! Breakpoints (after clamping to the configured maximum):
//!
//! | people      | label  |   | size (feet)  | label     |
//! |-------------|--------|---|--------------|-----------|
//! | 0 / unknown | `0`    |   | 0 / unknown  | `0`       |
//! | (0, 1]      | `1`    |   | (0, 25)      | `<25`     |
//! | (1, 4]      | `2-4`  |   | [25, 100)    | `25-99`   |
//! | (4, 9]      | `5-9`  |   | [100, 200)   | `100-199` |
//! | > 9         | `10+`  |   | >= 200       | `200+`    |
//!
//! Missing, negative, NaN and infinite inputs all land in the `0` bucket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeopleBin {
    Zero,
    One,
    TwoToFour,
    FiveToNine,
    TenPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeBin {
    Zero,
    Under25,
    From25To99,
    From100To199,
    From200,
}

/// Clamp into `[0, max]`; anything unusable becomes 0.
fn clamp_tag(raw: Option<f64>, max: f64) -> f64 {
    match raw {
        Some(v) if v.is_finite() && v > 0.0 => v.min(max),
        _ => 0.0,
    }
}

impl PeopleBin {
    pub const ALL: [PeopleBin; 5] = [
        PeopleBin::Zero,
        PeopleBin::One,
        PeopleBin::TwoToFour,
        PeopleBin::FiveToNine,
        PeopleBin::TenPlus,
    ];

    pub fn from_tag(raw: Option<f64>, max: f64) -> Self {
        let v = clamp_tag(raw, max);
        if v <= 0.0 {
            PeopleBin::Zero
        } else if v <= 1.0 {
            PeopleBin::One
        } else if v <= 4.0 {
            PeopleBin::TwoToFour
        } else if v <= 9.0 {
            PeopleBin::FiveToNine
        } else {
            PeopleBin::TenPlus
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PeopleBin::Zero => "0",
            PeopleBin::One => "1",
            PeopleBin::TwoToFour => "2-4",
            PeopleBin::FiveToNine => "5-9",
            PeopleBin::TenPlus => "10+",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        PeopleBin::ALL.iter().copied().find(|b| b.label() == label)
    }
}

impl SizeBin {
    pub const ALL: [SizeBin; 5] = [
        SizeBin::Zero,
        SizeBin::Under25,
        SizeBin::From25To99,
        SizeBin::From100To199,
        SizeBin::From200,
    ];

    pub fn from_tag(raw: Option<f64>, max: f64) -> Self {
        let v = clamp_tag(raw, max);
        if v <= 0.0 {
            SizeBin::Zero
        } else if v < 25.0 {
            SizeBin::Under25
        } else if v < 100.0 {
            SizeBin::From25To99
        } else if v < 200.0 {
            SizeBin::From100To199
        } else {
            SizeBin::From200
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SizeBin::Zero => "0",
            SizeBin::Under25 => "<25",
            SizeBin::From25To99 => "25-99",
            SizeBin::From100To199 => "100-199",
            SizeBin::From200 => "200+",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        SizeBin::ALL.iter().copied().find(|b| b.label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_values_fall_into_zero() {
        for raw in [None, Some(-3.0), Some(f64::NAN), Some(f64::INFINITY), Some(0.0)] {
            assert_eq!(PeopleBin::from_tag(raw, 25.0), PeopleBin::Zero);
            assert_eq!(SizeBin::from_tag(raw, 400.0), SizeBin::Zero);
        }
    }

    #[test]
    fn breakpoints() {
        assert_eq!(PeopleBin::from_tag(Some(1.0), 25.0), PeopleBin::One);
        assert_eq!(PeopleBin::from_tag(Some(4.0), 25.0), PeopleBin::TwoToFour);
        assert_eq!(PeopleBin::from_tag(Some(4.5), 25.0), PeopleBin::FiveToNine);
        assert_eq!(PeopleBin::from_tag(Some(10.0), 25.0), PeopleBin::TenPlus);
        assert_eq!(SizeBin::from_tag(Some(24.9), 400.0), SizeBin::Under25);
        assert_eq!(SizeBin::from_tag(Some(25.0), 400.0), SizeBin::From25To99);
        assert_eq!(SizeBin::from_tag(Some(199.0), 400.0), SizeBin::From100To199);
        assert_eq!(SizeBin::from_tag(Some(200.0), 400.0), SizeBin::From200);
    }

    #[test]
    fn oversized_values_clamp_to_the_top_bucket() {
        assert_eq!(PeopleBin::from_tag(Some(9_000.0), 25.0), PeopleBin::TenPlus);
        assert_eq!(SizeBin::from_tag(Some(1e9), 400.0), SizeBin::From200);
        // a small configured max pulls large values down into a lower bucket
        assert_eq!(SizeBin::from_tag(Some(350.0), 50.0), SizeBin::From25To99);
    }

    #[test]
    fn every_input_lands_in_exactly_one_bucket() {
        let mut v = -50.0;
        while v < 1_000.0 {
            let people = PeopleBin::from_tag(Some(v), 25.0);
            let size = SizeBin::from_tag(Some(v), 400.0);
            assert_eq!(PeopleBin::from_label(people.label()), Some(people));
            assert_eq!(SizeBin::from_label(size.label()), Some(size));
            v += 0.75;
        }
    }

    #[test]
    fn labels_outside_the_set_are_rejected() {
        assert_eq!(SizeBin::from_label("999"), None);
        assert_eq!(PeopleBin::from_label(""), None);
    }
}
