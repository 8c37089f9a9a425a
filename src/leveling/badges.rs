//! Static badge catalog
//!
//! Badges unlock at level thresholds and are never revoked. The catalog is
//! built once and only ever read.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::BadgeEligibility;

/// An immutable milestone reward unlocked at a level threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeDefinition {
    pub id: String,
    pub level_threshold: u32,
    pub name: String,
    pub description: String,
    pub icon: String,
}

impl BadgeDefinition {
    pub fn new(id: &str, level_threshold: u32, name: &str, description: &str, icon: &str) -> Self {
        Self {
            id: id.to_string(),
            level_threshold,
            name: name.to_string(),
            description: description.to_string(),
            icon: icon.to_string(),
        }
    }
}

/// Badge definitions ordered by ascending threshold.
#[derive(Debug, Clone)]
pub struct BadgeCatalog {
    badges: Vec<BadgeDefinition>,
}

impl BadgeCatalog {
    /// Build a catalog from arbitrary definitions; they are sorted by threshold.
    pub fn new(mut badges: Vec<BadgeDefinition>) -> Self {
        badges.sort_by_key(|b| b.level_threshold);
        Self { badges }
    }

    /// The built-in catalog shipped with the platform.
    pub fn standard() -> Self {
        Self::new(vec![
            BadgeDefinition::new("rising_star", 5, "Rising Star", "Reached level 5", "star"),
            BadgeDefinition::new("regular", 10, "Regular", "Reached level 10", "coffee"),
            BadgeDefinition::new("contributor", 25, "Contributor", "Reached level 25", "pen"),
            BadgeDefinition::new("veteran", 50, "Veteran", "Reached level 50", "shield"),
            BadgeDefinition::new("elite", 100, "Elite", "Reached level 100", "gem"),
            BadgeDefinition::new("champion", 250, "Champion", "Reached level 250", "trophy"),
            BadgeDefinition::new("legend", 500, "Legend", "Reached level 500", "crown"),
            BadgeDefinition::new("mythic", 750, "Mythic", "Reached level 750", "dragon"),
            BadgeDefinition::new("immortal", 1000, "Immortal", "Reached the level cap", "infinity"),
        ])
    }

    pub fn all(&self) -> &[BadgeDefinition] {
        &self.badges
    }

    pub fn get(&self, id: &str) -> Option<&BadgeDefinition> {
        self.badges.iter().find(|b| b.id == id)
    }

    /// Every badge with a threshold at or below `level`.
    pub fn badges_earned(&self, level: u32) -> &[BadgeDefinition] {
        let end = self.badges.partition_point(|b| b.level_threshold <= level);
        &self.badges[..end]
    }

    /// The first badge still locked at `level`, if any.
    pub fn next_badge(&self, level: u32) -> Option<&BadgeDefinition> {
        self.badges.iter().find(|b| b.level_threshold > level)
    }

    /// Earned-by-level badges missing from `earned`, in threshold order.
    pub fn newly_earned<'a>(
        &'a self,
        level: u32,
        earned: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a BadgeDefinition> + 'a {
        self.badges_earned(level)
            .iter()
            .filter(move |b| !earned.contains(&b.id))
    }

    pub fn check_eligibility(&self, level: u32, earned: &BTreeSet<String>) -> BadgeEligibility {
        let next = self.next_badge(level).cloned();
        BadgeEligibility {
            newly_eligible: self.newly_earned(level, earned).cloned().collect(),
            levels_to_next: next.as_ref().map(|b| b.level_threshold - level),
            next_badge: next,
        }
    }
}

impl Default for BadgeCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_on_construction() {
        let catalog = BadgeCatalog::new(vec![
            BadgeDefinition::new("b", 20, "B", "", ""),
            BadgeDefinition::new("a", 3, "A", "", ""),
        ]);
        assert_eq!(catalog.all()[0].id, "a");
    }

    #[test]
    fn test_badges_earned() {
        let catalog = BadgeCatalog::standard();
        assert!(catalog.badges_earned(4).is_empty());
        assert_eq!(catalog.badges_earned(5).len(), 1);
        assert_eq!(catalog.badges_earned(49).len(), 3);
        assert_eq!(catalog.badges_earned(1000).len(), catalog.all().len());
    }

    #[test]
    fn test_next_badge() {
        let catalog = BadgeCatalog::standard();
        assert_eq!(catalog.next_badge(1).unwrap().id, "rising_star");
        assert_eq!(catalog.next_badge(5).unwrap().id, "regular");
        assert!(catalog.next_badge(1000).is_none());
    }

    #[test]
    fn test_check_eligibility() {
        let catalog = BadgeCatalog::standard();
        let earned: BTreeSet<String> = ["rising_star".to_string()].into_iter().collect();

        let result = catalog.check_eligibility(12, &earned);
        let ids: Vec<&str> = result.newly_eligible.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["regular"]);
        assert_eq!(result.next_badge.unwrap().id, "contributor");
        assert_eq!(result.levels_to_next, Some(13));

        let capped = catalog.check_eligibility(1000, &BTreeSet::new());
        assert_eq!(capped.newly_eligible.len(), catalog.all().len());
        assert!(capped.next_badge.is_none());
        assert!(capped.levels_to_next.is_none());
    }
}
