mod annotate;
mod args;
mod common;
mod constants;
mod matcher;
mod normalize;
mod registry;
mod resolver;
mod roster;

use anyhow::{Context, Result, bail};
use clap::Parser;
use reqwest::Client;
use std::collections::HashSet;
use std::fs;

use annotate::{RowFlag, annotate};
use args::Args;
use common::{delete_if_exists, project_root};
use matcher::match_claim;
use normalize::SuffixTable;
use registry::{CandidateRegistry, build_registry_records, export_registry_csv};
use resolver::{MatchQuality, resolve};
use roster::{read_roster, write_output};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dir = project_root();
    let data_dir = project_dir.join("data");
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed creating data directory {}", data_dir.display()))?;

    let roster_path = args
        .roster_path
        .clone()
        .unwrap_or_else(|| data_dir.join("provider_roster.csv"));
    let output_path = args
        .output_path
        .clone()
        .unwrap_or_else(|| data_dir.join("provider_roster_matched.csv"));
    let registry_csv = args
        .registry_csv
        .clone()
        .unwrap_or_else(|| data_dir.join("location_registry.csv"));
    let cache_db = args
        .cache_db
        .clone()
        .unwrap_or_else(|| data_dir.join("registry_cache.sqlite"));

    let client = Client::builder()
        .user_agent("roster-location-matcher/0.1")
        .build()
        .context("Failed creating HTTP client")?;

    if args.reset_registry {
        delete_if_exists(&cache_db)?;
        delete_if_exists(&registry_csv)?;
        println!("Reset registry state (deleted cache DB and exported registry CSV).");
    }

    let table = match &args.suffix_csv {
        Some(path) => SuffixTable::from_csv(path)?,
        None => SuffixTable::built_in(),
    };

    if !roster_path.exists() {
        bail!("Roster file missing at {}", roster_path.display());
    }
    let claims = read_roster(&roster_path, &table)?;
    println!(
        "Loaded {} provider rows from {}",
        claims.len(),
        roster_path.display()
    );
    if claims.is_empty() {
        bail!("Roster {} has no data rows", roster_path.display());
    }

    let mut seen = HashSet::new();
    let practice_ids: Vec<String> = claims
        .iter()
        .map(|c| c.practice_id.clone())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect();
    println!("Roster covers {} distinct practices.", practice_ids.len());

    let records = build_registry_records(&args, &client, &practice_ids, &cache_db).await?;
    export_registry_csv(&records, &registry_csv)?;

    let registry = CandidateRegistry::from_records(&records, &table);
    if registry.is_empty() {
        // No candidates at all is a setup failure, not a run with zero matches.
        bail!(
            "Location registry is empty; nothing to match against. \
             Check API access or rerun without --skip-api."
        );
    }
    println!(
        "Candidate registry holds {} locations across {} practices.",
        registry.len(),
        practice_ids.len()
    );

    let mut assignments = Vec::with_capacity(claims.len());
    for claim in &claims {
        let outcome = match_claim(&claim.address, &registry, &table);
        assignments.push(resolve(
            &claim.address,
            claim.declared_mode,
            &outcome,
            &registry,
            &table,
        ));
    }

    let report = annotate(&claims, &assignments, &registry);
    write_output(&output_path, &claims, &assignments, &report)?;

    let count = |quality: MatchQuality| {
        assignments
            .iter()
            .filter(|a| a.match_quality == quality)
            .count()
    };
    println!("Wrote {}", output_path.display());
    println!(
        "Matched: {} exact, {} fuzzy, {} via abbreviation, {} unmatched.",
        count(MatchQuality::Matched),
        count(MatchQuality::MatchedFuzzy),
        count(MatchQuality::MatchedAbbreviation),
        count(MatchQuality::Unmatched)
    );
    println!(
        "Review flags: {} suffix review, {} location-type mismatch, {} both-mode id problems, {} registry rows without canonical IDs.",
        report.flag_count(RowFlag::RequiresManualSuffixReview),
        report.flag_count(RowFlag::InconsistentLocationType),
        report.flag_count(RowFlag::DuplicateIdentifier),
        report.registry_gap_rows.len()
    );

    Ok(())
}
