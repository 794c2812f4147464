use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::annotate::AuditReport;
use crate::normalize::{
    Address, SuffixTable, normalize_roster_zip, smart_title_case, split_street,
};
use crate::resolver::Assignment;

/// How the provider says they practice at this address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredMode {
    Telehealth,
    InOffice,
    Both,
    Unspecified,
}

impl DeclaredMode {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("telehealth") {
            DeclaredMode::Telehealth
        } else if trimmed.eq_ignore_ascii_case("in-office") {
            DeclaredMode::InOffice
        } else if trimmed.eq_ignore_ascii_case("both") {
            DeclaredMode::Both
        } else {
            DeclaredMode::Unspecified
        }
    }
}

/// One roster row, already normalized for matching. Raw inputs are kept for
/// the output file.
#[derive(Debug, Clone)]
pub struct ProviderClaim {
    /// 1-based spreadsheet row, counting the header as row 1.
    pub row: usize,
    pub npi: String,
    pub practice_id: String,
    pub raw_address: String,
    pub raw_mode: String,
    pub declared_mode: DeclaredMode,
    pub address: Address,
}

impl ProviderClaim {
    /// Location type label for the output file. Unrecognized declarations
    /// pass through as written.
    pub fn location_type_label(&self) -> String {
        match self.declared_mode {
            DeclaredMode::Telehealth => "Virtual".to_string(),
            DeclaredMode::InOffice => "In Person".to_string(),
            DeclaredMode::Both => "Both".to_string(),
            DeclaredMode::Unspecified => self.raw_mode.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(rename = "NPI", default)]
    npi: String,
    #[serde(rename = "Practice ID", default)]
    practice_id: String,
    #[serde(rename = "Facility Address", default)]
    facility_address: String,
    #[serde(rename = "Address line 2", default)]
    address_line_2: String,
    #[serde(rename = "Facility City", default)]
    facility_city: String,
    #[serde(rename = "Facility State", default)]
    facility_state: String,
    #[serde(rename = "Facility Zip", default)]
    facility_zip: String,
    #[serde(rename = "Telehealth or In-Office or Both", default)]
    mode: String,
}

fn claim_from_row(row: RosterRow, row_number: usize, table: &SuffixTable) -> ProviderClaim {
    let (street_line, mut secondary_line) = split_street(&row.facility_address, table);
    let explicit_secondary = smart_title_case(row.address_line_2.trim());
    if !explicit_secondary.is_empty() {
        secondary_line = if secondary_line.is_empty() {
            explicit_secondary
        } else {
            format!("{secondary_line} {explicit_secondary}")
        };
    }

    ProviderClaim {
        row: row_number,
        npi: row.npi.trim().to_string(),
        practice_id: row.practice_id.trim().to_string(),
        raw_address: row.facility_address.trim().to_string(),
        raw_mode: row.mode.clone(),
        declared_mode: DeclaredMode::parse(&row.mode),
        address: Address {
            street_line,
            secondary_line,
            city: smart_title_case(row.facility_city.trim()),
            state: row.facility_state.trim().to_uppercase(),
            postal_code: normalize_roster_zip(&row.facility_zip),
        },
    }
}

/// Reads the provider roster CSV. Missing cells become empty strings; only
/// I/O and malformed-CSV problems are errors.
pub fn read_roster(path: &Path, table: &SuffixTable) -> Result<Vec<ProviderClaim>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed opening roster {}", path.display()))?;
    let mut claims = Vec::new();
    for (index, row) in reader.deserialize::<RosterRow>().enumerate() {
        let row = row.with_context(|| format!("Failed reading roster {}", path.display()))?;
        // Header is row 1, first data row is row 2.
        claims.push(claim_from_row(row, index + 2, table));
    }
    Ok(claims)
}

const OUTPUT_HEADER: [&str; 13] = [
    "NPI",
    "Practice ID",
    "Facility Address",
    "Address line 1",
    "Address line 2",
    "City",
    "State",
    "ZIP Code",
    "Location Type",
    "Location ID 1",
    "Location ID 2",
    "Matched",
    "Review Flags",
];

/// Writes the annotated roster. Goes to a temp file first, then renames over
/// the target so a crash never leaves a half-written output.
pub fn write_output(
    path: &Path,
    claims: &[ProviderClaim],
    assignments: &[Assignment],
    report: &AuditReport,
) -> Result<()> {
    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        writer.write_record(OUTPUT_HEADER)?;
        for ((claim, assignment), flags) in claims
            .iter()
            .zip(assignments.iter())
            .zip(report.provider_flags.iter())
        {
            let flag_text = flags
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            writer.write_record([
                claim.npi.as_str(),
                claim.practice_id.as_str(),
                claim.raw_address.as_str(),
                claim.address.street_line.as_str(),
                claim.address.secondary_line.as_str(),
                claim.address.city.as_str(),
                claim.address.state.as_str(),
                claim.address.postal_code.as_str(),
                &claim.location_type_label(),
                assignment.location_id_1.as_str(),
                assignment.location_id_2.as_str(),
                &assignment.status_text(),
                &flag_text,
            ])?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed moving output into place at {}", path.display()))?;
    Ok(())
}
