use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand};
use uuid::Uuid;

use mealsync_core::{
    DaySummary, MealPayload, MealRepository, MealType, Nutrient, QueuedMeal, SyncStatus,
};

use super::{parse_date, OutputFormat};

#[derive(Args)]
pub struct MealCommand {
    #[command(subcommand)]
    pub command: MealSubcommand,
}

#[derive(Subcommand)]
pub enum MealSubcommand {
    /// Log a meal. Works offline; it syncs when the server is reachable.
    Log {
        /// Meal type (breakfast, lunch, dinner, snack)
        #[arg(long = "type", short = 't', value_name = "TYPE")]
        meal_type: String,

        /// Date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        /// What was eaten
        #[arg(long, short = 'm')]
        description: Option<String>,

        /// Reference to a photo of the meal
        #[arg(long)]
        image: Option<String>,

        /// Nutrient as NAME=AMOUNT[UNIT], e.g. protein=25g (can be repeated)
        #[arg(long = "nutrient", short = 'n', value_name = "NUTRIENT")]
        nutrients: Vec<String>,
    },

    /// Show today's meals with nutrition totals
    Today {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// View meal history
    History {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Start date (YYYY-MM-DD), defaults to 7 days before the end date
        #[arg(long)]
        from: Option<String>,

        /// End date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        to: Option<String>,
    },

    /// Show one meal with its sync state
    Show {
        /// Meal ID (UUID)
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Change a logged meal. Only the given fields change.
    Edit {
        /// Meal ID (UUID)
        id: String,

        #[arg(long = "type", short = 't', value_name = "TYPE")]
        meal_type: Option<String>,

        #[arg(long, short)]
        date: Option<String>,

        #[arg(long, short = 'm')]
        description: Option<String>,

        #[arg(long)]
        image: Option<String>,

        /// Replaces the whole nutrient list when given
        #[arg(long = "nutrient", short = 'n', value_name = "NUTRIENT")]
        nutrients: Vec<String>,
    },

    /// Queue a failed meal for another sync attempt
    Retry {
        /// Meal ID (UUID)
        id: String,
    },

    /// Delete a meal (also from the server once it is reachable)
    Delete {
        /// Meal ID (UUID)
        id: String,
    },
}

impl MealCommand {
    pub async fn run(&self, repo: &MealRepository) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            MealSubcommand::Log {
                meal_type,
                date,
                description,
                image,
                nutrients,
            } => {
                let date = match date {
                    Some(d) => parse_date(d)?,
                    None => Local::now().date_naive(),
                };
                let meal_type: MealType = meal_type.parse()?;

                let mut payload =
                    MealPayload::new(date, meal_type).with_nutrients(parse_nutrients(nutrients)?);
                if let Some(d) = description {
                    payload = payload.with_description(d);
                }
                if let Some(i) = image {
                    payload = payload.with_image_ref(i);
                }

                let meal = repo.save(payload).await?;
                println!("Logged meal:");
                println!();
                print_meal_details(&meal);
                Ok(())
            }
            MealSubcommand::Today { format } => {
                let summary = repo.day_summary(Local::now().date_naive()).await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                    OutputFormat::Text => print_day(&summary),
                }
                Ok(())
            }
            MealSubcommand::History { format, from, to } => {
                self.show_history(*format, from, to, repo).await
            }
            MealSubcommand::Show { id, format } => {
                let id = parse_id(id)?;
                let meal = repo
                    .get(id)
                    .await?
                    .ok_or_else(|| format!("Meal not found: {}", id))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&meal)?),
                    OutputFormat::Text => {
                        print!("{}", meal);
                        println!("Attempts: {}", meal.attempt_count);
                        println!("ID: {}", meal.id);
                    }
                }
                Ok(())
            }
            MealSubcommand::Edit {
                id,
                meal_type,
                date,
                description,
                image,
                nutrients,
            } => {
                let id = parse_id(id)?;
                let current = repo
                    .get(id)
                    .await?
                    .ok_or_else(|| format!("Meal not found: {}", id))?;

                let mut payload = current.payload;
                if let Some(t) = meal_type {
                    payload.meal_type = t.parse()?;
                }
                if let Some(d) = date {
                    payload.date = parse_date(d)?;
                }
                if let Some(d) = description {
                    payload.description = Some(d.clone());
                }
                if let Some(i) = image {
                    payload.image_ref = Some(i.clone());
                }
                if !nutrients.is_empty() {
                    payload.nutrients = parse_nutrients(nutrients)?;
                }

                let meal = repo.update(id, payload).await?;
                if meal.id == id {
                    println!("Updated meal:");
                } else {
                    println!("Meal {} was already synced, logged the edit as a new meal:", id);
                }
                println!();
                print_meal_details(&meal);
                Ok(())
            }
            MealSubcommand::Retry { id } => {
                let id = parse_id(id)?;
                let meal = repo.retry(id).await?;
                match meal.sync_status {
                    SyncStatus::Pending => println!("Meal {} queued for sync.", id),
                    status => println!("Meal {} is {}, nothing to retry.", id, status),
                }
                Ok(())
            }
            MealSubcommand::Delete { id } => {
                let id = parse_id(id)?;
                let removal = repo.delete(id).await?;
                if removal.remote_delete_queued {
                    println!("Deleted meal {}. The server copy will be removed on next sync.", id);
                } else {
                    println!("Deleted meal {}.", id);
                }
                Ok(())
            }
        }
    }

    async fn show_history(
        &self,
        format: OutputFormat,
        from: &Option<String>,
        to: &Option<String>,
        repo: &MealRepository,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let today = Local::now().date_naive();
        let to_date = match to {
            Some(d) => parse_date(d)?,
            None => today,
        };
        let from_date = match from {
            Some(d) => parse_date(d)?,
            None => to_date - chrono::Duration::days(7),
        };

        let meals = repo.list_range(from_date, to_date).await?;

        if meals.is_empty() {
            println!("No meal history found for {} to {}", from_date, to_date);
            return Ok(());
        }

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&meals)?);
            }
            OutputFormat::Text => {
                for (i, day) in group_by_date(meals).into_iter().enumerate() {
                    if i > 0 {
                        println!();
                    }
                    print_day(&day);
                }
            }
        }

        Ok(())
    }
}

fn parse_id(id: &str) -> Result<Uuid, String> {
    Uuid::parse_str(id).map_err(|_| format!("Invalid meal UUID: {}", id))
}

fn parse_nutrients(values: &[String]) -> Result<Vec<Nutrient>, String> {
    values.iter().map(|v| parse_nutrient(v)).collect()
}

/// Parses `NAME=AMOUNT[UNIT]`, e.g. `protein=25g` or `calories=450 kcal`.
fn parse_nutrient(value: &str) -> Result<Nutrient, String> {
    let invalid = || format!("Invalid nutrient '{}'. Use NAME=AMOUNT[UNIT].", value);

    let (name, quantity) = value.split_once('=').ok_or_else(invalid)?;
    let name = name.trim();
    let quantity = quantity.trim();
    if name.is_empty() {
        return Err(invalid());
    }

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (amount, unit) = quantity.split_at(split);
    let amount: f64 = amount.parse().map_err(|_| invalid())?;

    Ok(Nutrient::new(name, amount, unit.trim()))
}

/// Splits meals (already ordered by date) into per-day summaries.
fn group_by_date(meals: Vec<QueuedMeal>) -> Vec<DaySummary> {
    let mut days: Vec<(NaiveDate, Vec<QueuedMeal>)> = Vec::new();
    for meal in meals {
        match days.last_mut() {
            Some((date, group)) if *date == meal.payload.date => group.push(meal),
            _ => days.push((meal.payload.date, vec![meal])),
        }
    }
    days.into_iter()
        .map(|(date, meals)| DaySummary::from_meals(date, meals))
        .collect()
}

fn print_day(day: &DaySummary) {
    println!("{}", day.date);
    println!("{}", "-".repeat(60));

    if day.meals.is_empty() {
        println!("  No meals logged");
        return;
    }

    for meal in &day.meals {
        let description = meal.payload.description.as_deref().unwrap_or("");
        println!(
            "  {:10} {:8} {}",
            meal.payload.meal_type,
            sync_marker(meal),
            description
        );
        if !meal.payload.nutrients.is_empty() {
            println!("             {}", format_nutrients(&meal.payload.nutrients));
        }
    }

    if !day.totals.is_empty() {
        println!("  {}", "-".repeat(56));
        println!("  Daily Total: {}", format_nutrients(&day.totals));
    }
    let unsynced = day.unsynced();
    if unsynced > 0 {
        println!("  {} meal(s) not synced yet", unsynced);
    }
}

fn sync_marker(meal: &QueuedMeal) -> &'static str {
    if meal.is_rejected() {
        return "[rejected]";
    }
    match meal.sync_status {
        SyncStatus::Synced => "",
        SyncStatus::Pending => "[pending]",
        SyncStatus::Syncing => "[syncing]",
        SyncStatus::Failed => "[failed]",
    }
}

/// Format nutrients for display: "calories: 650 kcal | protein: 25 g"
fn format_nutrients(nutrients: &[Nutrient]) -> String {
    nutrients
        .iter()
        .map(|n| format!("{}: {:.0} {}", n.name, n.amount, n.unit).trim_end().to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

fn print_meal_details(meal: &QueuedMeal) {
    let p = &meal.payload;
    println!("  Date: {}", p.date);
    println!("  Meal: {}", p.meal_type);
    if let Some(d) = &p.description {
        println!("  Description: {}", d);
    }
    if !p.nutrients.is_empty() {
        println!("  Nutrition: {}", format_nutrients(&p.nutrients));
    }
    println!("  Sync: {}", meal.sync_status);
    println!();
    println!("Meal ID: {}", meal.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nutrient_with_unit() {
        let n = parse_nutrient("protein=25.5g").unwrap();
        assert_eq!(n, Nutrient::new("protein", 25.5, "g"));

        let n = parse_nutrient("calories = 450 kcal").unwrap();
        assert_eq!(n, Nutrient::new("calories", 450.0, "kcal"));
    }

    #[test]
    fn test_parse_nutrient_without_unit() {
        let n = parse_nutrient("servings=2").unwrap();
        assert_eq!(n.amount, 2.0);
        assert_eq!(n.unit, "");
    }

    #[test]
    fn test_parse_nutrient_invalid() {
        assert!(parse_nutrient("protein").is_err());
        assert!(parse_nutrient("=25g").is_err());
        assert!(parse_nutrient("protein=lots").is_err());
    }

    #[test]
    fn test_parse_id() {
        assert!(parse_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_group_by_date() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 3, d).unwrap();
        let meals = vec![
            QueuedMeal::new(MealPayload::new(day(1), MealType::Breakfast)),
            QueuedMeal::new(MealPayload::new(day(1), MealType::Dinner)),
            QueuedMeal::new(MealPayload::new(day(3), MealType::Lunch)),
        ];

        let days = group_by_date(meals);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, day(1));
        assert_eq!(days[0].meals.len(), 2);
        assert_eq!(days[1].date, day(3));
    }

    #[test]
    fn test_format_nutrients() {
        let nutrients = vec![
            Nutrient::new("calories", 650.0, "kcal"),
            Nutrient::new("servings", 1.0, ""),
        ];
        assert_eq!(format_nutrients(&nutrients), "calories: 650 kcal | servings: 1");
    }
}
