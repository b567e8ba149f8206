use serde::{Deserialize, Serialize};
use std::fmt;

/// One line of a nutrition breakdown, e.g. `protein: 25 g`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Nutrient {
    pub name: String,
    pub amount: f64,
    pub unit: String,
}

impl Nutrient {
    pub fn new(name: impl Into<String>, amount: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            amount,
            unit: unit.into(),
        }
    }
}

impl fmt::Display for Nutrient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.name, self.amount, self.unit)
    }
}

/// Sums nutrient lists by name, keeping first-seen order and unit.
///
/// Names are compared case-insensitively so `Protein` and `protein` add up.
pub fn sum_nutrients<'a, I>(lists: I) -> Vec<Nutrient>
where
    I: IntoIterator<Item = &'a [Nutrient]>,
{
    let mut totals: Vec<Nutrient> = Vec::new();
    for list in lists {
        for nutrient in list {
            match totals
                .iter_mut()
                .find(|t| t.name.eq_ignore_ascii_case(&nutrient.name))
            {
                Some(total) => total.amount += nutrient.amount,
                None => totals.push(nutrient.clone()),
            }
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nutrient_display() {
        let nutrient = Nutrient::new("protein", 15.5, "g");
        assert_eq!(format!("{}", nutrient), "protein: 15.5 g");
    }

    #[test]
    fn test_sum_nutrients_merges_by_name() {
        let breakfast = vec![
            Nutrient::new("calories", 350.0, "kcal"),
            Nutrient::new("protein", 12.0, "g"),
        ];
        let lunch = vec![
            Nutrient::new("Protein", 30.0, "g"),
            Nutrient::new("fiber", 6.0, "g"),
        ];

        let totals = sum_nutrients([breakfast.as_slice(), lunch.as_slice()]);

        assert_eq!(totals.len(), 3);
        assert_eq!(totals[0], Nutrient::new("calories", 350.0, "kcal"));
        assert_eq!(totals[1].amount, 42.0);
        assert_eq!(totals[2].name, "fiber");
    }

    #[test]
    fn test_sum_nutrients_empty() {
        let totals = sum_nutrients(std::iter::empty::<&[Nutrient]>());
        assert!(totals.is_empty());
    }
}
