//! Free-pool computation for substitution cover.
//!
//! Eligibility is set elimination over independent record sets: start from
//! the active roster, drop teachers absent/on leave that date, drop teachers
//! with a regular assignment at the slot, drop teachers already booked as a
//! substitute at `(date, slot)`. Membership in the result is binary; there
//! is no "busy but overridable" row.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub name: String,
}

pub fn free_pool(
    roster: Vec<Candidate>,
    absent: &HashSet<String>,
    busy_assigned: &HashSet<String>,
    busy_substituting: &HashSet<String>,
) -> Vec<Candidate> {
    let mut free: Vec<Candidate> = roster
        .into_iter()
        .filter(|t| {
            !absent.contains(&t.id)
                && !busy_assigned.contains(&t.id)
                && !busy_substituting.contains(&t.id)
        })
        .collect();
    free.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teacher(id: &str, name: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn eliminates_every_busy_category() {
        let roster = vec![
            teacher("t1", "Aslam"),
            teacher("t2", "Bushra"),
            teacher("t3", "Danish"),
            teacher("t4", "Erum"),
        ];
        let free = free_pool(roster, &set(&["t1"]), &set(&["t2"]), &set(&["t3"]));
        assert_eq!(free, vec![teacher("t4", "Erum")]);
    }

    #[test]
    fn result_never_intersects_input_sets() {
        let roster: Vec<Candidate> = (0..20)
            .map(|i| teacher(&format!("t{i}"), &format!("Teacher {i:02}")))
            .collect();
        let absent = set(&["t0", "t5", "t10"]);
        let busy = set(&["t1", "t5", "t11"]);
        let subbing = set(&["t2", "t10", "t12"]);

        let free = free_pool(roster, &absent, &busy, &subbing);
        for t in &free {
            assert!(!absent.contains(&t.id));
            assert!(!busy.contains(&t.id));
            assert!(!subbing.contains(&t.id));
        }
        assert_eq!(free.len(), 20 - 8);
    }

    #[test]
    fn sorted_by_name_then_id() {
        let roster = vec![
            teacher("b", "Zafar"),
            teacher("a", "Zafar"),
            teacher("c", "Amna"),
        ];
        let free = free_pool(roster, &HashSet::new(), &HashSet::new(), &HashSet::new());
        let ids: Vec<&str> = free.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
