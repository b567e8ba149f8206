use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Meal category a logged meal is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }
}

impl fmt::Display for MealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "breakfast" => Ok(MealType::Breakfast),
            "lunch" => Ok(MealType::Lunch),
            "dinner" => Ok(MealType::Dinner),
            "snack" => Ok(MealType::Snack),
            _ => Err(format!(
                "Invalid meal type '{}'. Valid options: breakfast, lunch, dinner, snack",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meal_type_parses_case_insensitively() {
        assert_eq!(MealType::from_str("LUNCH").unwrap(), MealType::Lunch);
        assert_eq!(MealType::from_str(" snack ").unwrap(), MealType::Snack);
        assert_eq!(MealType::Dinner.to_string(), "dinner");
    }

    #[test]
    fn test_meal_type_rejects_unknown() {
        let err = MealType::from_str("brunch").unwrap_err();
        assert!(err.contains("brunch"));
        assert!(MealType::from_str("").is_err());
    }

    #[test]
    fn test_meal_type_serializes_lowercase() {
        let json = serde_json::to_string(&MealType::Breakfast).unwrap();
        assert_eq!(json, "\"breakfast\"");
    }
}
