use std::collections::HashMap;

use crate::registry::{CandidateRegistry, LocationType};
use crate::resolver::{Assignment, MatchQuality};
use crate::roster::{DeclaredMode, ProviderClaim};

/// Review categories attached to rows for downstream presentation. Derived
/// only; nothing here changes an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlag {
    RequiresManualSuffixReview,
    DuplicateIdentifier,
    UnmatchedAddressFields,
    InconsistentLocationType,
    RegistryGapRow,
}

impl RowFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            RowFlag::RequiresManualSuffixReview => "suffix review",
            RowFlag::DuplicateIdentifier => "duplicate or missing location id",
            RowFlag::UnmatchedAddressFields => "unmatched address fields",
            RowFlag::InconsistentLocationType => "location type mismatch",
            RowFlag::RegistryGapRow => "registry row missing canonical id",
        }
    }
}

#[derive(Debug)]
pub struct AuditReport {
    /// Flags per provider row, same order as the claims.
    pub provider_flags: Vec<Vec<RowFlag>>,
    /// Registry entries with no canonical identifier.
    pub registry_gap_rows: Vec<usize>,
}

impl AuditReport {
    pub fn flag_count(&self, flag: RowFlag) -> usize {
        let provider_count = self
            .provider_flags
            .iter()
            .flatten()
            .filter(|f| **f == flag)
            .count();
        if flag == RowFlag::RegistryGapRow {
            provider_count + self.registry_gap_rows.len()
        } else {
            provider_count
        }
    }
}

/// Classifies every assignment for human review. The assignments themselves
/// are left untouched.
pub fn annotate(
    claims: &[ProviderClaim],
    assignments: &[Assignment],
    registry: &CandidateRegistry,
) -> AuditReport {
    let type_by_id: HashMap<&str, LocationType> = registry
        .iter()
        .filter(|l| !l.canonical_id.is_empty())
        .filter_map(|l| l.location_type.map(|t| (l.canonical_id.as_str(), t)))
        .collect();

    let mut provider_flags = Vec::with_capacity(assignments.len());
    for (claim, assignment) in claims.iter().zip(assignments.iter()) {
        let mut flags = Vec::new();

        if matches!(
            assignment.match_quality,
            MatchQuality::MatchedFuzzy | MatchQuality::MatchedAbbreviation
        ) {
            flags.push(RowFlag::RequiresManualSuffixReview);
        }
        if assignment.match_quality == MatchQuality::Unmatched {
            flags.push(RowFlag::UnmatchedAddressFields);
        }
        if assignment.both_mode_invalid {
            flags.push(RowFlag::DuplicateIdentifier);
        }
        if mode_conflicts(claim.declared_mode, assignment, &type_by_id) {
            flags.push(RowFlag::InconsistentLocationType);
        }

        provider_flags.push(flags);
    }

    AuditReport {
        provider_flags,
        registry_gap_rows: registry.gap_rows(),
    }
}

/// True when the registry's type for an assigned location disagrees with the
/// provider's declared mode: a Telehealth-only claim holding an in-person
/// site, or an In-Office-only claim holding a virtual one.
fn mode_conflicts(
    declared_mode: DeclaredMode,
    assignment: &Assignment,
    type_by_id: &HashMap<&str, LocationType>,
) -> bool {
    let assigned_types = [&assignment.location_id_1, &assignment.location_id_2]
        .into_iter()
        .filter(|id| !id.trim().is_empty())
        .filter_map(|id| type_by_id.get(id.as_str()).copied());

    for location_type in assigned_types {
        let conflict = match declared_mode {
            DeclaredMode::Telehealth => location_type == LocationType::InPerson,
            DeclaredMode::InOffice => location_type == LocationType::Virtual,
            DeclaredMode::Both | DeclaredMode::Unspecified => false,
        };
        if conflict {
            return true;
        }
    }
    false
}
