mod meal;
mod meal_type;
mod nutrient;
mod sync_status;

pub use meal::{DaySummary, MealPayload, QueuedMeal};
pub use meal_type::MealType;
pub use nutrient::{sum_nutrients, Nutrient};
pub use sync_status::{FailureKind, SyncStatus};
