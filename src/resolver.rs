use std::collections::BTreeSet;

use crate::matcher::{MIN_STREET_SIMILARITY, MatchBasis, MatchOutcome, token_sort_ratio};
use crate::normalize::{Address, SuffixTable};
use crate::registry::{CandidateRegistry, LocationType};
use crate::roster::DeclaredMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchQuality {
    Matched,
    MatchedFuzzy,
    MatchedAbbreviation,
    Unmatched,
}

/// Address fields that can independently fail to find any registry match.
/// Ordering matches the reviewer-facing reason list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldName {
    Street,
    City,
    PostalCode,
    State,
    SecondaryLine,
}

impl FieldName {
    fn roster_column(self) -> &'static str {
        match self {
            FieldName::Street => "Facility Address",
            FieldName::City => "Facility City",
            FieldName::PostalCode => "Facility Zip",
            FieldName::State => "Facility State",
            FieldName::SecondaryLine => "Address line 2",
        }
    }
}

/// Final per-provider output of one resolution pass.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub location_id_1: String,
    pub location_id_2: String,
    pub match_quality: MatchQuality,
    pub unmatched_reasons: BTreeSet<FieldName>,
    pub street_suggestions: Vec<String>,
    pub rewrite: Option<(String, String)>,
    /// Declared "Both" but the two slots are not two distinct non-blank IDs.
    /// Reported for review, never corrected.
    pub both_mode_invalid: bool,
}

impl Assignment {
    /// Reviewer-facing status string for the `Matched` column.
    pub fn status_text(&self) -> String {
        match self.match_quality {
            MatchQuality::Matched => "Yes".to_string(),
            MatchQuality::MatchedFuzzy => "Yes {fuzzy match}".to_string(),
            MatchQuality::MatchedAbbreviation => match &self.rewrite {
                Some((from, to)) => format!("Yes {{abbreviation match: '{from}' to '{to}'}}"),
                None => "Yes {abbreviation match}".to_string(),
            },
            MatchQuality::Unmatched => {
                let mut reasons = Vec::new();
                for field in &self.unmatched_reasons {
                    if *field == FieldName::Street && !self.street_suggestions.is_empty() {
                        reasons.push(format!(
                            "{} ({})",
                            field.roster_column(),
                            self.street_suggestions.join("; ")
                        ));
                    } else {
                        reasons.push(field.roster_column().to_string());
                    }
                }
                format!("No - {}", reasons.join(", "))
            }
        }
    }
}

/// Applies the assignment policy to a claim's match outcome: best InPerson
/// candidate fills slot 1 and best Virtual candidate fills slot 2,
/// independently; "Both" claims are validity-checked; the shift rule runs
/// last so slot 1 is never blank while slot 2 is filled.
pub fn resolve(
    address: &Address,
    declared_mode: DeclaredMode,
    outcome: &MatchOutcome,
    registry: &CandidateRegistry,
    table: &SuffixTable,
) -> Assignment {
    if outcome.is_empty() {
        let (unmatched_reasons, street_suggestions) = unmatched_fields(address, registry, table);
        return Assignment {
            location_id_1: String::new(),
            location_id_2: String::new(),
            match_quality: MatchQuality::Unmatched,
            unmatched_reasons,
            street_suggestions,
            rewrite: None,
            both_mode_invalid: declared_mode == DeclaredMode::Both,
        };
    }

    let in_person = outcome
        .candidates
        .iter()
        .find(|c| c.location.location_type == Some(LocationType::InPerson));
    let virtual_ = outcome
        .candidates
        .iter()
        .find(|c| c.location.location_type == Some(LocationType::Virtual));
    // A registry row with an undetermined type can still be the only match;
    // it takes slot 1 rather than leaving a matched row with no assignment.
    let untyped = if in_person.is_none() && virtual_.is_none() {
        outcome
            .candidates
            .iter()
            .find(|c| c.location.location_type.is_none())
    } else {
        None
    };

    let mut location_id_1 = in_person
        .or(untyped)
        .map(|c| c.location.canonical_id.clone())
        .unwrap_or_default();
    let mut location_id_2 = virtual_
        .map(|c| c.location.canonical_id.clone())
        .unwrap_or_default();

    // Quality reflects whichever pass produced the candidates actually used;
    // the weakest basis wins when the two slots disagree.
    let used_bases: Vec<MatchBasis> = [in_person, virtual_, untyped]
        .into_iter()
        .flatten()
        .map(|c| c.basis)
        .collect();
    let match_quality = if outcome.rewrite.is_some() {
        MatchQuality::MatchedAbbreviation
    } else if used_bases.contains(&MatchBasis::FuzzyAddress) {
        MatchQuality::MatchedFuzzy
    } else {
        MatchQuality::Matched
    };

    let both_mode_invalid = declared_mode == DeclaredMode::Both
        && (location_id_1.trim().is_empty()
            || location_id_2.trim().is_empty()
            || location_id_1 == location_id_2);

    // Shift rule: slot 1 is always populated before slot 2 whenever exactly
    // one assignment exists. Runs last, regardless of declared mode.
    if location_id_1.trim().is_empty() && !location_id_2.trim().is_empty() {
        location_id_1 = std::mem::take(&mut location_id_2);
    }

    Assignment {
        location_id_1,
        location_id_2,
        match_quality,
        unmatched_reasons: BTreeSet::new(),
        street_suggestions: Vec::new(),
        rewrite: outcome.rewrite.clone(),
        both_mode_invalid,
    }
}

/// Field-by-field check against the whole registry: which claim fields found
/// no match anywhere, independently of each other. Street comparisons also
/// try both-direction suffix rewrites so the suggestion text can point at
/// the fix.
fn unmatched_fields(
    address: &Address,
    registry: &CandidateRegistry,
    table: &SuffixTable,
) -> (BTreeSet<FieldName>, Vec<String>) {
    let variants = street_variants(&address.street_line, table);

    let mut street_ok = false;
    let mut city_ok = false;
    let mut state_ok = false;
    let mut zip_ok = false;
    let mut secondary_ok = false;

    for location in registry.iter() {
        let theirs = &location.address;
        if !street_ok
            && variants
                .iter()
                .any(|v| token_sort_ratio(v, &theirs.street_line) >= MIN_STREET_SIMILARITY)
        {
            street_ok = true;
        }
        if !city_ok && eq_fold(&address.city, &theirs.city) {
            city_ok = true;
        }
        if !state_ok && eq_fold(&address.state, &theirs.state) {
            state_ok = true;
        }
        if !zip_ok && address.postal_code.trim() == theirs.postal_code.trim() {
            zip_ok = true;
        }
        if !secondary_ok && eq_fold(&address.secondary_line, &theirs.secondary_line) {
            secondary_ok = true;
        }
    }

    let mut reasons = BTreeSet::new();
    let mut suggestions = Vec::new();
    if !street_ok {
        reasons.insert(FieldName::Street);
        for token in address.street_line.split_whitespace() {
            let word = token.trim_matches(|c: char| c == ',' || c == '.');
            for replacement in table.rewrites_for(word) {
                suggestions.push(format!("try converting '{word}' to '{replacement}'"));
            }
        }
    }
    if !city_ok {
        reasons.insert(FieldName::City);
    }
    if !zip_ok {
        reasons.insert(FieldName::PostalCode);
    }
    if !state_ok {
        reasons.insert(FieldName::State);
    }
    if address.has_secondary() && !secondary_ok {
        reasons.insert(FieldName::SecondaryLine);
    }
    (reasons, suggestions)
}

fn eq_fold(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// The street line plus its all-words rewrites in each direction.
fn street_variants(street_line: &str, table: &SuffixTable) -> Vec<String> {
    let mut variants = vec![street_line.to_string()];
    let tokens: Vec<&str> = street_line.split_whitespace().collect();
    let to_postal: Vec<String> = tokens
        .iter()
        .map(|t| {
            let word = t.trim_matches(|c: char| c == ',' || c == '.');
            table.postal_form(word).unwrap_or(t).to_string()
        })
        .collect();
    let to_common: Vec<String> = tokens
        .iter()
        .map(|t| {
            let word = t.trim_matches(|c: char| c == ',' || c == '.');
            table.common_form(word).unwrap_or(t).to_string()
        })
        .collect();
    let postal_line = to_postal.join(" ");
    let common_line = to_common.join(" ");
    if postal_line != variants[0] {
        variants.push(postal_line);
    }
    if common_line != variants[0] {
        variants.push(common_line);
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::match_claim;
    use crate::registry::RegistryRecord;
    use serde_json::Value;

    fn registry_from(rows: Vec<(&str, &str, &str, &str, &str, bool)>) -> CandidateRegistry {
        let table = SuffixTable::built_in();
        let records: Vec<RegistryRecord> = rows
            .into_iter()
            .map(|(id, street, city, state, zip, virtual_)| RegistryRecord {
                is_virtual: Value::Bool(virtual_),
                address_1: street.to_string(),
                address_2: String::new(),
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
            })
            .collect();
        CandidateRegistry::from_records(&records, &table)
    }

    fn address(street: &str, city: &str, state: &str, zip: &str) -> Address {
        Address {
            street_line: street.to_string(),
            secondary_line: String::new(),
            city: city.to_string(),
            state: state.to_string(),
            postal_code: zip.to_string(),
        }
    }

    fn run(
        addr: &Address,
        mode: DeclaredMode,
        registry: &CandidateRegistry,
    ) -> Assignment {
        let table = SuffixTable::built_in();
        let outcome = match_claim(addr, registry, &table);
        resolve(addr, mode, &outcome, registry, &table)
    }

    #[test]
    fn suffix_insensitive_claim_resolves_to_slot_one() {
        let registry = registry_from(vec![(
            "L1",
            "123 Main Street",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        let table = SuffixTable::built_in();
        let (street, _) = crate::normalize::split_street("123 Main St", &table);
        let addr = address(&street, "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::InOffice, &registry);
        assert_eq!(assignment.location_id_1, "L1");
        assert_eq!(assignment.location_id_2, "");
        assert_eq!(assignment.match_quality, MatchQuality::Matched);
        assert_eq!(assignment.status_text(), "Yes");
    }

    #[test]
    fn virtual_only_match_shifts_into_slot_one() {
        let registry = registry_from(vec![(
            "V1",
            "22 Telecare Way",
            "Boston",
            "MA",
            "02134",
            true,
        )]);
        let addr = address("22 Telecare Way", "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::Telehealth, &registry);
        assert_eq!(assignment.location_id_1, "V1");
        assert_eq!(assignment.location_id_2, "");
    }

    #[test]
    fn untyped_candidate_still_fills_slot_one() {
        // `is_virtual` came back null, so the registry row carries no type;
        // the match must still assign it instead of reporting Yes with two
        // blank slots.
        let table = SuffixTable::built_in();
        let records = vec![RegistryRecord {
            is_virtual: Value::Null,
            address_1: "123 Main Street".to_string(),
            address_2: String::new(),
            city: "Boston".to_string(),
            state: "MA".to_string(),
            zip: "02134".to_string(),
            location_id: "L1".to_string(),
            monolith_location_id: String::new(),
            software: String::new(),
            software_id: String::new(),
            phone: String::new(),
            virtual_visit_type: String::new(),
            practice_id: "P1".to_string(),
        }];
        let registry = CandidateRegistry::from_records(&records, &table);
        let addr = address("123 Main Street", "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::InOffice, &registry);
        assert_eq!(assignment.location_id_1, "L1");
        assert_eq!(assignment.location_id_2, "");
        assert_eq!(assignment.match_quality, MatchQuality::Matched);
    }

    #[test]
    fn both_mode_with_one_resolved_slot_is_flagged() {
        let registry = registry_from(vec![(
            "L1",
            "123 Main Street",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        let addr = address("123 Main Street", "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::Both, &registry);
        assert_eq!(assignment.location_id_1, "L1");
        assert_eq!(assignment.location_id_2, "");
        assert!(assignment.both_mode_invalid);
    }

    #[test]
    fn both_mode_with_two_distinct_slots_is_valid() {
        let registry = registry_from(vec![
            ("L1", "123 Main Street", "Boston", "MA", "02134", false),
            ("V1", "123 Main Street", "Boston", "MA", "02134", true),
        ]);
        let addr = address("123 Main Street", "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::Both, &registry);
        assert_eq!(assignment.location_id_1, "L1");
        assert_eq!(assignment.location_id_2, "V1");
        assert!(!assignment.both_mode_invalid);
    }

    #[test]
    fn unmatched_reports_each_failing_field() {
        let registry = registry_from(vec![(
            "L1",
            "123 Main Street",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        let addr = address("500 Nowhere Walk", "Springfield", "IL", "62701");
        let assignment = run(&addr, DeclaredMode::InOffice, &registry);
        assert_eq!(assignment.match_quality, MatchQuality::Unmatched);
        assert!(assignment.unmatched_reasons.contains(&FieldName::Street));
        assert!(assignment.unmatched_reasons.contains(&FieldName::City));
        assert!(assignment.unmatched_reasons.contains(&FieldName::State));
        assert!(assignment.unmatched_reasons.contains(&FieldName::PostalCode));
        assert_eq!(
            assignment.status_text(),
            "No - Facility Address, Facility City, Facility Zip, Facility State"
        );
    }

    #[test]
    fn unmatched_street_suggests_suffix_conversions() {
        let registry = registry_from(vec![(
            "L1",
            "450 Commerce Boulevard",
            "Boston",
            "MA",
            "02134",
            false,
        )]);
        // City/state/zip line up, the street does not; "St" is a known
        // abbreviation so the status proposes the conversion.
        let addr = address("88 Harbor St", "Boston", "MA", "02134");
        let assignment = run(&addr, DeclaredMode::InOffice, &registry);
        assert_eq!(assignment.match_quality, MatchQuality::Unmatched);
        assert!(assignment.unmatched_reasons.contains(&FieldName::Street));
        assert!(
            assignment
                .street_suggestions
                .contains(&"try converting 'St' to 'Street'".to_string())
        );
        assert!(assignment.status_text().starts_with(
            "No - Facility Address (try converting 'St' to 'Street'"
        ));
    }

    #[test]
    fn abbreviation_match_reports_the_substitution() {
        let registry = registry_from(vec![(
            "L3",
            "100 Oak Point Plaza",
            "Salem",
            "OR",
            "97301",
            false,
        )]);
        let addr = address("100 Oak Pt Plaza", "Salem", "OR", "97301");
        let assignment = run(&addr, DeclaredMode::InOffice, &registry);
        assert_eq!(assignment.match_quality, MatchQuality::MatchedAbbreviation);
        assert_eq!(
            assignment.status_text(),
            "Yes {abbreviation match: 'Pt' to 'Point'}"
        );
    }

    #[test]
    fn shift_rule_never_leaves_slot_one_blank() {
        let registry = registry_from(vec![
            ("V1", "9 Remote Road", "Boston", "MA", "02134", true),
            ("L1", "123 Main Street", "Boston", "MA", "02134", false),
        ]);
        for mode in [
            DeclaredMode::Telehealth,
            DeclaredMode::InOffice,
            DeclaredMode::Both,
            DeclaredMode::Unspecified,
        ] {
            let addr = address("9 Remote Road", "Boston", "MA", "02134");
            let assignment = run(&addr, mode, &registry);
            assert!(
                !(assignment.location_id_1.is_empty() && !assignment.location_id_2.is_empty()),
                "slot one blank while slot two filled for {mode:?}"
            );
        }
    }
}
