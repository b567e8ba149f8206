use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::meal_type::MealType;
use super::nutrient::{sum_nutrients, Nutrient};
use super::sync_status::{FailureKind, SyncStatus};

/// The content of a logged meal, as sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPayload {
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub nutrients: Vec<Nutrient>,
    /// When the user says the meal was eaten. Not touched by sync.
    pub logged_at: DateTime<Utc>,
}

impl MealPayload {
    pub fn new(date: NaiveDate, meal_type: MealType) -> Self {
        Self {
            date,
            meal_type,
            description: None,
            image_ref: None,
            nutrients: Vec::new(),
            logged_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn with_nutrients(mut self, nutrients: Vec<Nutrient>) -> Self {
        self.nutrients = nutrients;
        self
    }

    pub fn logged_at(mut self, logged_at: DateTime<Utc>) -> Self {
        self.logged_at = logged_at;
        self
    }

    /// Amount of the named nutrient, if the breakdown has it.
    pub fn nutrient(&self, name: &str) -> Option<f64> {
        self.nutrients
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
            .map(|n| n.amount)
    }
}

/// A meal row in the local queue together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMeal {
    /// Client-generated; doubles as the idempotency key for remote upserts.
    pub id: Uuid,
    pub payload: MealPayload,
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub attempt_count: u32,
    pub ever_synced: bool,
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMeal {
    pub fn new(payload: MealPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            sync_status: SyncStatus::Pending,
            last_error: None,
            failure_kind: None,
            attempt_count: 0,
            ever_synced: false,
            queued_at: now,
            updated_at: now,
        }
    }

    /// Failed because the remote refused it, not because it was unreachable.
    pub fn is_rejected(&self) -> bool {
        self.sync_status == SyncStatus::Failed && self.failure_kind == Some(FailureKind::Rejected)
    }
}

impl fmt::Display for QueuedMeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.payload;
        writeln!(f, "Meal: {} - {}", p.date, p.meal_type)?;
        writeln!(f, "{}", "=".repeat(30))?;

        if let Some(description) = &p.description {
            writeln!(f, "{}", description)?;
        }
        if let Some(image) = &p.image_ref {
            writeln!(f, "Photo: {}", image)?;
        }
        if !p.nutrients.is_empty() {
            writeln!(f, "Nutrition:")?;
            for nutrient in &p.nutrients {
                writeln!(f, "  - {}", nutrient)?;
            }
        }

        write!(f, "Sync: {}", self.sync_status)?;
        if let Some(error) = &self.last_error {
            write!(f, " ({})", error)?;
        }
        writeln!(f)
    }
}

/// Meals of one day with their summed nutrition.
#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub meals: Vec<QueuedMeal>,
    pub totals: Vec<Nutrient>,
}

impl DaySummary {
    pub fn from_meals(date: NaiveDate, meals: Vec<QueuedMeal>) -> Self {
        let totals = sum_nutrients(meals.iter().map(|m| m.payload.nutrients.as_slice()));
        Self {
            date,
            meals,
            totals,
        }
    }

    pub fn total(&self, name: &str) -> f64 {
        self.totals
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
            .map(|n| n.amount)
            .unwrap_or(0.0)
    }

    /// Meals that have not reached the remote yet.
    pub fn unsynced(&self) -> usize {
        self.meals
            .iter()
            .filter(|m| m.sync_status != SyncStatus::Synced)
            .count()
    }
}
