//! Quick-add phrases. Built-in categories come first, then custom ones from
//! configuration.

use crate::error::{Result, VisitError};
use crate::types::CategorySuggestion;

fn category(id: &str, label: &str, phrases: &[&str]) -> CategorySuggestion {
    CategorySuggestion {
        id: id.to_string(),
        label: label.to_string(),
        phrases: phrases.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn built_in_categories() -> Vec<CategorySuggestion> {
    vec![
        category(
            "feeding",
            "Feeding",
            &[
                "Good latch observed",
                "Fed on both sides",
                "Bottle feed",
                "Discussed feeding positions",
            ],
        ),
        category(
            "diapers",
            "Diapers",
            &["Wet diaper", "Dirty diaper", "Diaper change demonstrated"],
        ),
        category(
            "sleep",
            "Sleep",
            &["Baby napping", "Safe sleep reviewed", "Swaddling practiced"],
        ),
        category(
            "parent_care",
            "Parent Care",
            &[
                "Parent rested",
                "Meal prepared",
                "Emotional check-in",
                "Recovery going well",
            ],
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct CategoryCatalog {
    categories: Vec<CategorySuggestion>,
}

impl CategoryCatalog {
    /// Built-ins plus `custom`. A custom category reusing a built-in id is skipped.
    pub fn new(custom: Vec<CategorySuggestion>) -> Self {
        let mut categories = built_in_categories();
        for entry in custom {
            if categories.iter().any(|existing| existing.id == entry.id) {
                tracing::warn!(category_id = %entry.id, "Skipping custom category with duplicate id");
                continue;
            }
            categories.push(entry);
        }
        Self { categories }
    }

    pub fn categories(&self) -> &[CategorySuggestion] {
        &self.categories
    }

    pub fn phrase(&self, category_id: &str, index: usize) -> Result<&str> {
        let category = self
            .categories
            .iter()
            .find(|category| category.id == category_id)
            .ok_or_else(|| VisitError::validation(format!("unknown category: {}", category_id)))?;
        category
            .phrases
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                VisitError::validation(format!(
                    "category {} has no phrase at index {}",
                    category_id, index
                ))
            })
    }
}

impl Default for CategoryCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
