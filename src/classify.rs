use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Category {
    Duplicate,
    Moderate,
    Tentative,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Duplicate => write!(f, "Duplicate"),
            Category::Moderate => write!(f, "Moderate"),
            Category::Tentative => write!(f, "Tentative"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Confidence {
    pub percentage: f64,
    pub category: Category,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Maps a probability to a percentage rounded to two decimals and its
/// category. Bounds are inclusive on the higher category.
pub fn classify(probability: f64) -> Confidence {
    let probability = if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    };
    let percentage = round2(probability * 100.0);
    let category = if percentage >= 90.0 {
        Category::Duplicate
    } else if percentage >= 70.0 {
        Category::Moderate
    } else {
        Category::Tentative
    };
    Confidence {
        percentage,
        category,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_belong_to_the_higher_category() {
        assert_eq!(classify(0.9).category, Category::Duplicate);
        assert_eq!(classify(0.8999).category, Category::Moderate);
        assert_eq!(classify(0.7).category, Category::Moderate);
        assert_eq!(classify(0.6999).category, Category::Tentative);
    }

    #[test]
    fn percentage_is_rounded_to_two_places() {
        assert_eq!(classify(0.8999).percentage, 89.99);
        assert_eq!(classify(0.123456).percentage, 12.35);
        assert_eq!(classify(1.0).percentage, 100.0);
        assert_eq!(classify(0.0).percentage, 0.0);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        assert_eq!(classify(1.7).percentage, 100.0);
        assert_eq!(classify(-0.2).category, Category::Tentative);
        assert_eq!(classify(f64::NAN).percentage, 0.0);
    }
}
