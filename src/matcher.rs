use crate::normalize::{Address, SuffixTable};
use crate::registry::{CandidateRegistry, Location};

/// Minimum token-sort similarity (0..=100) for a street line to count as a
/// match.
pub const MIN_STREET_SIMILARITY: u32 = 85;

/// Which pass produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBasis {
    Exact,
    FuzzyAddress,
    AbbreviationRewrite,
}

/// A scored registry candidate for one claim. Score counts matched fields
/// among street, secondary (or its shared absence), city, state, zip.
#[derive(Debug, Clone)]
pub struct MatchCandidate<'a> {
    pub location: &'a Location,
    pub score: u8,
    pub basis: MatchBasis,
}

/// The full result of one matching pass over a claim: candidates best-first,
/// plus the abbreviation substitution used, if any.
#[derive(Debug)]
pub struct MatchOutcome<'a> {
    pub candidates: Vec<MatchCandidate<'a>>,
    pub rewrite: Option<(String, String)>,
}

impl MatchOutcome<'_> {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

fn eq_fold(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn token_sort_key(s: &str) -> String {
    let mut tokens: Vec<String> = s
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort();
    tokens.join(" ")
}

/// Token-sort similarity ratio in 0..=100. The underlying edit-distance
/// library is an implementation detail; callers only see the ratio.
pub fn token_sort_ratio(a: &str, b: &str) -> u32 {
    let key_a = token_sort_key(a);
    let key_b = token_sort_key(b);
    if key_a == key_b {
        return if key_a.is_empty() { 0 } else { 100 };
    }
    if key_a.is_empty() || key_b.is_empty() {
        return 0;
    }
    (strsim::normalized_levenshtein(&key_a, &key_b) * 100.0).round() as u32
}

/// Exact-field filter: city, state and zip must match, the secondary line
/// must match when the claim has one, and the street line must be equal or
/// fuzzy-similar. Candidates come back best score first; ties keep registry
/// order.
fn filter_candidates<'a>(
    address: &Address,
    street_line: &str,
    registry: &'a CandidateRegistry,
) -> Vec<MatchCandidate<'a>> {
    let mut candidates = Vec::new();
    for location in registry.iter() {
        let theirs = &location.address;
        if !eq_fold(&address.city, &theirs.city)
            || !eq_fold(&address.state, &theirs.state)
            || address.postal_code.trim() != theirs.postal_code.trim()
        {
            continue;
        }
        if address.has_secondary() && !eq_fold(&address.secondary_line, &theirs.secondary_line) {
            continue;
        }

        let basis = if eq_fold(street_line, &theirs.street_line) {
            MatchBasis::Exact
        } else if token_sort_ratio(street_line, &theirs.street_line) >= MIN_STREET_SIMILARITY {
            MatchBasis::FuzzyAddress
        } else {
            continue;
        };

        let secondary_point = if address.has_secondary() {
            1 // equality already enforced above
        } else if !theirs.has_secondary() {
            1 // both absent
        } else {
            0
        };
        let score = 4 + secondary_point; // street + city + state + zip + secondary

        candidates.push(MatchCandidate {
            location,
            score,
            basis,
        });
    }
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates
}

fn rewritten_street(tokens: &[&str], index: usize, replacement: &str) -> String {
    tokens
        .iter()
        .enumerate()
        .map(|(i, t)| if i == index { replacement } else { t })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Multi-pass matching for one normalized claim address. Each pass only runs
/// when the previous one found nothing.
pub fn match_claim<'a>(
    address: &Address,
    registry: &'a CandidateRegistry,
    table: &SuffixTable,
) -> MatchOutcome<'a> {
    // Pass 1: exact fields with fuzzy street tolerance.
    let candidates = filter_candidates(address, &address.street_line, registry);
    if !candidates.is_empty() {
        return MatchOutcome {
            candidates,
            rewrite: None,
        };
    }

    // Pass 2: retry with each street word swapped through the suffix table,
    // both directions. First rewrite that matches wins.
    let tokens: Vec<&str> = address.street_line.split_whitespace().collect();
    for (index, raw_token) in tokens.iter().enumerate() {
        let word = raw_token.trim_matches(|c: char| c == ',' || c == '.');
        if word.is_empty() {
            continue;
        }
        for replacement in table.rewrites_for(word) {
            let candidate_line = rewritten_street(&tokens, index, &replacement);
            let mut found = filter_candidates(address, &candidate_line, registry);
            if !found.is_empty() {
                for candidate in &mut found {
                    candidate.basis = MatchBasis::AbbreviationRewrite;
                }
                return MatchOutcome {
                    candidates: found,
                    rewrite: Some((word.to_string(), replacement)),
                };
            }
        }
    }

    // Pass 3: address-only fallback across the whole registry. Best single
    // candidate, lowest confidence; first encountered wins ties.
    let mut best: Option<(u32, &Location)> = None;
    for location in registry.iter() {
        let ratio = token_sort_ratio(&address.street_line, &location.address.street_line);
        if ratio >= MIN_STREET_SIMILARITY && best.is_none_or(|(top, _)| ratio > top) {
            best = Some((ratio, location));
        }
    }
    if let Some((_, location)) = best {
        return MatchOutcome {
            candidates: vec![MatchCandidate {
                location,
                score: 1,
                basis: MatchBasis::FuzzyAddress,
            }],
            rewrite: None,
        };
    }

    MatchOutcome {
        candidates: Vec::new(),
        rewrite: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LocationType, RegistryRecord};
    use serde_json::Value;

    fn registry_from(rows: Vec<(&str, &str, &str, &str, &str, &str, bool)>) -> CandidateRegistry {
        let table = SuffixTable::built_in();
        let records: Vec<RegistryRecord> = rows
            .into_iter()
            .map(
                |(id, street, secondary, city, state, zip, virtual_)| RegistryRecord {
                    is_virtual: Value::Bool(virtual_),
                    address_1: street.to_string(),
                    address_2: secondary.to_string(),
                    city: city.to_string(),
                    state: state.to_string(),
                    zip: zip.to_string(),
                    location_id: id.to_string(),
                    monolith_location_id: String::new(),
                    software: String::new(),
                    software_id: String::new(),
                    phone: String::new(),
                    virtual_visit_type: String::new(),
                    practice_id: "P1".to_string(),
                },
            )
            .collect();
        CandidateRegistry::from_records(&records, &table)
    }

    fn claim(street: &str, secondary: &str, city: &str, state: &str, zip: &str) -> Address {
        Address {
            street_line: street.to_string(),
            secondary_line: secondary.to_string(),
            city: city.to_string(),
            state: state.to_string(),
            postal_code: zip.to_string(),
        }
    }

    #[test]
    fn suffix_variants_match_in_the_exact_pass() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L1",
            "123 Main Street",
            "",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        // Claim arrives pre-normalized, so "St" has become "Street".
        let (street, secondary) = crate::normalize::split_street("123 Main St", &table);
        let address = claim(&street, &secondary, "Boston", "MA", "02134");
        let outcome = match_claim(&address, &registry, &table);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].score, 5);
        assert_eq!(outcome.candidates[0].basis, MatchBasis::Exact);
        assert_eq!(outcome.candidates[0].location.canonical_id, "L1");
        assert!(outcome.rewrite.is_none());
    }

    #[test]
    fn fuzzy_street_still_scores_five() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L1",
            "123 East Main Street",
            "",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        let address = claim("123 Main Street East", "", "Boston", "MA", "02134");
        let outcome = match_claim(&address, &registry, &table);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].basis, MatchBasis::FuzzyAddress);
        assert_eq!(outcome.candidates[0].score, 5);
    }

    #[test]
    fn abbreviation_pass_rewrites_an_inner_word() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L3",
            "100 Oak Point Plaza",
            "",
            "Salem",
            "OR",
            "97301",
            false,
        )]);
        let address = claim("100 Oak Pt Plaza", "", "Salem", "OR", "97301");
        let outcome = match_claim(&address, &registry, &table);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].basis, MatchBasis::AbbreviationRewrite);
        assert_eq!(
            outcome.rewrite,
            Some(("Pt".to_string(), "Point".to_string()))
        );
    }

    #[test]
    fn fallback_ignores_city_state_zip() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L4",
            "77 River Road",
            "",
            "Concord",
            "NH",
            "03301",
            false,
        )]);
        // Wrong city and zip; only the street lines up.
        let address = claim("77 River Road", "", "Nashua", "NH", "03060");
        let outcome = match_claim(&address, &registry, &table);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].score, 1);
        assert_eq!(outcome.candidates[0].location.canonical_id, "L4");
    }

    #[test]
    fn tie_break_keeps_registry_order() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![
            ("A1", "5 Hill Street", "", "Boston", "MA", "02134", false),
            ("A2", "5 Hill Street", "", "Boston", "MA", "02134", true),
        ]);
        let address = claim("5 Hill Street", "", "Boston", "MA", "02134");
        let outcome = match_claim(&address, &registry, &table);
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].location.canonical_id, "A1");
        assert_eq!(
            outcome.candidates[0].location.location_type,
            Some(LocationType::InPerson)
        );
    }

    #[test]
    fn secondary_mismatch_excludes_candidate() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L5",
            "9 Cedar Street",
            "Suite 100",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        // The suite mismatch knocks the candidate out of the first two
        // passes; the street-only fallback still surfaces it at the lowest
        // confidence.
        let with_wrong_suite = claim("9 Cedar Street", "Suite 200", "Boston", "MA", "02134");
        let fallback = match_claim(&with_wrong_suite, &registry, &table);
        assert_eq!(fallback.candidates.len(), 1);
        assert_eq!(fallback.candidates[0].score, 1);
        assert_eq!(fallback.candidates[0].basis, MatchBasis::FuzzyAddress);

        // A claim with no secondary still matches, at score 4.
        let without_suite = claim("9 Cedar Street", "", "Boston", "MA", "02134");
        let outcome = match_claim(&without_suite, &registry, &table);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].score, 4);
    }

    #[test]
    fn no_candidates_is_a_normal_outcome() {
        let table = SuffixTable::built_in();
        let registry = registry_from(vec![(
            "L6",
            "1 Far Away Drive",
            "",
            "Austin",
            "TX",
            "73301",
            false,
        )]);
        let address = claim("500 Nowhere Lane", "", "Boston", "MA", "02134");
        assert!(match_claim(&address, &registry, &table).is_empty());
    }
}
