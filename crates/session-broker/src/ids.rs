//! Identifier and display-name generation.

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

const ANIMALS: &[&str] = &["Fox", "Panda", "Dolphin", "Koala", "Tiger", "Eagle"];

/// Generate a fresh unique identifier (rooms, peers, transports, streams).
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a display name for a newly connected peer, e.g. "Koala-417".
#[must_use]
pub fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Peer");
    let number: u16 = rng.gen_range(0..1000);
    format!("{animal}-{number}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_ids_are_unique() {
        let ids: HashSet<String> = (0..100).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_display_name_shape() {
        let name = random_display_name();
        let (animal, number) = name.split_once('-').expect("name should contain a dash");
        assert!(ANIMALS.contains(&animal));
        assert!(number.parse::<u16>().unwrap() < 1000);
    }
}
