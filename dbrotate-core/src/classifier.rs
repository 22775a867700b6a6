/*!
Tier classification.

Decides which tiers a new artifact joins, from its capture instant and the
current members of one store. The function is pure: it reads the inventory
and never changes it, so classifying is also how dry runs are answered.

Calendar periods are evaluated in UTC. A week is an ISO-8601 week (Monday
start, ISO week-year), a month is a (year, month) pair.
*/

use chrono::{DateTime, Datelike, Utc};

use crate::artifact::{Tier, TierSet};
use crate::config::RetentionPolicy;
use crate::retention::Inventory;

/// Whether two instants fall in the same ISO week
pub fn same_week(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.iso_week() == b.iso_week()
}

/// Whether two instants fall in the same calendar month
pub fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a.year(), a.month()) == (b.year(), b.month())
}

/// Tiers an artifact captured at `captured_at` should join
///
/// * daily: always
/// * weekly: unless a weekly member was captured in the same ISO week
/// * monthly: unless a monthly member was captured in the same month
///
/// A tier with capacity 0 is never assigned.
pub fn classify(captured_at: DateTime<Utc>, inventory: &Inventory, policy: &RetentionPolicy) -> TierSet {
    let mut tiers = TierSet::new();
    for tier in Tier::ALL {
        if policy.capacity(tier) == 0 {
            continue;
        }
        let claimed = match tier {
            Tier::Daily => false,
            Tier::Weekly => inventory
                .members(tier)
                .iter()
                .any(|m| same_week(m.captured_at, captured_at)),
            Tier::Monthly => inventory
                .members(tier)
                .iter()
                .any(|m| same_month(m.captured_at, captured_at)),
        };
        if !claimed {
            tiers.insert(tier);
        }
    }
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactName, PayloadFormat};
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 3, 0, 0).unwrap()
    }

    fn set(tiers: &[Tier]) -> TierSet {
        tiers.iter().copied().collect()
    }

    fn name(t: DateTime<Utc>) -> ArtifactName {
        ArtifactName::new("all", t, PayloadFormat::Plain)
    }

    #[test]
    fn test_same_week_uses_iso_weeks() {
        // 2024-01-01 is a Monday
        assert!(same_week(at(2024, 1, 1), at(2024, 1, 7)));
        assert!(!same_week(at(2024, 1, 7), at(2024, 1, 8)));
        // 2020-12-31 and 2021-01-01 both sit in ISO week 53 of 2020
        assert!(same_week(at(2020, 12, 31), at(2021, 1, 1)));
        // same week number, different ISO years
        assert!(!same_week(at(2023, 1, 2), at(2024, 1, 1)));
    }

    #[test]
    fn test_same_month() {
        assert!(same_month(at(2024, 2, 1), at(2024, 2, 29)));
        assert!(!same_month(at(2024, 2, 29), at(2024, 3, 1)));
        assert!(!same_month(at(2023, 2, 1), at(2024, 2, 1)));
    }

    #[test]
    fn test_empty_store_gets_every_tier() {
        let tiers = classify(at(2024, 5, 15), &Inventory::default(), &RetentionPolicy::default());
        assert_eq!(tiers, set(&Tier::ALL));
    }

    #[test]
    fn test_existing_week_and_month_members_block() {
        let mut inventory = Inventory::default();
        inventory.insert(Tier::Weekly, name(at(2024, 5, 13)));
        inventory.insert(Tier::Monthly, name(at(2024, 5, 1)));

        let tiers = classify(at(2024, 5, 15), &inventory, &RetentionPolicy::default());
        assert_eq!(tiers, set(&[Tier::Daily]));

        // next week, same month
        let tiers = classify(at(2024, 5, 20), &inventory, &RetentionPolicy::default());
        assert_eq!(tiers, set(&[Tier::Daily, Tier::Weekly]));
    }

    #[test]
    fn test_daily_membership_does_not_block_weekly() {
        let mut inventory = Inventory::default();
        inventory.insert(Tier::Daily, name(at(2024, 5, 13)));

        let tiers = classify(at(2024, 5, 14), &inventory, &RetentionPolicy::default());
        assert!(tiers.contains(Tier::Weekly));
    }

    #[test]
    fn test_zero_capacity_never_assigned() {
        let policy = RetentionPolicy::new(0, 3, 0);
        let tiers = classify(at(2024, 5, 15), &Inventory::default(), &policy);
        assert_eq!(tiers, set(&[Tier::Weekly]));
    }
}
