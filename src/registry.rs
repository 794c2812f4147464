use anyhow::{Context, Result, anyhow};
use csv::Writer;
use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, header::RETRY_AFTER};
use rusqlite::{Connection as SqliteConnection, OptionalExtension, params};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    args::Args,
    common::{is_retryable_status, parse_retry_after, truncate_for_log, wait_for_rate_slot},
    constants::{PRACTICE_ID_BATCH_PATH, PRACTICE_LOCATION_BATCH_PATH},
    normalize::{Address, SuffixTable, normalize_zip, smart_title_case, split_street},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationType {
    InPerson,
    Virtual,
}

/// One canonical site from the external registry, ready for matching.
#[derive(Debug, Clone)]
pub struct Location {
    pub canonical_id: String,
    pub address: Address,
    pub location_type: Option<LocationType>,
}

/// Raw location row as returned by the practice location endpoint. The
/// service is loose about field types (zips as numbers, `is_virtual` as a
/// bool or a string), so stringish fields are coerced on deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub is_virtual: Value,
    #[serde(default)]
    pub address_1: String,
    #[serde(default)]
    pub address_2: String,
    #[serde(default, deserialize_with = "stringish")]
    pub city: String,
    #[serde(default, deserialize_with = "stringish")]
    pub state: String,
    #[serde(default, deserialize_with = "stringish")]
    pub zip: String,
    #[serde(default, deserialize_with = "stringish")]
    pub location_id: String,
    #[serde(default, deserialize_with = "stringish")]
    pub monolith_location_id: String,
    #[serde(default)]
    pub software: String,
    #[serde(default, deserialize_with = "stringish")]
    pub software_id: String,
    #[serde(default, deserialize_with = "stringish")]
    pub phone: String,
    #[serde(default)]
    pub virtual_visit_type: String,
    #[serde(skip)]
    pub practice_id: String,
}

fn stringish<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Declared service mode of a raw registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryMode {
    InPerson,
    Virtual,
    Both,
    Unknown,
}

fn parse_mode(is_virtual: &Value) -> RegistryMode {
    match is_virtual {
        Value::Bool(true) => RegistryMode::Virtual,
        Value::Bool(false) => RegistryMode::InPerson,
        Value::String(s) => match s.trim().to_uppercase().as_str() {
            "TRUE" => RegistryMode::Virtual,
            "FALSE" => RegistryMode::InPerson,
            "BOTH" => RegistryMode::Both,
            _ => RegistryMode::Unknown,
        },
        _ => RegistryMode::Unknown,
    }
}

/// Immutable snapshot of known locations for one matching pass. Iteration
/// order is the registry fetch order and stays fixed so tie-breaks are
/// deterministic.
#[derive(Debug)]
pub struct CandidateRegistry {
    locations: Vec<Location>,
}

impl CandidateRegistry {
    /// Deduplicates by canonical ID (first occurrence wins, blank IDs are
    /// always kept), then expands "Both"-mode rows into one InPerson and one
    /// Virtual entry sharing the same address.
    pub fn from_records(records: &[RegistryRecord], table: &SuffixTable) -> Self {
        let mut seen_ids = std::collections::HashSet::new();
        let mut locations = Vec::new();
        for record in records {
            let canonical_id = record.location_id.trim().to_string();
            if !canonical_id.is_empty() && !seen_ids.insert(canonical_id.clone()) {
                continue;
            }
            let (street_line, unit) = split_street(&record.address_1, table);
            let secondary_line = match (unit.is_empty(), record.address_2.trim().is_empty()) {
                (true, true) => String::new(),
                (false, true) => unit,
                (true, false) => smart_title_case(record.address_2.trim()),
                (false, false) => {
                    format!("{} {}", unit, smart_title_case(record.address_2.trim()))
                }
            };
            let address = Address {
                street_line,
                secondary_line,
                city: smart_title_case(record.city.trim()),
                state: record.state.trim().to_uppercase(),
                postal_code: normalize_zip(record.zip.split('-').next().unwrap_or("")),
            };
            let base = Location {
                canonical_id,
                address,
                location_type: None,
            };
            match parse_mode(&record.is_virtual) {
                RegistryMode::InPerson => locations.push(Location {
                    location_type: Some(LocationType::InPerson),
                    ..base
                }),
                RegistryMode::Virtual => locations.push(Location {
                    location_type: Some(LocationType::Virtual),
                    ..base
                }),
                RegistryMode::Both => {
                    locations.push(Location {
                        location_type: Some(LocationType::InPerson),
                        ..base.clone()
                    });
                    locations.push(Location {
                        location_type: Some(LocationType::Virtual),
                        ..base
                    });
                }
                RegistryMode::Unknown => locations.push(base),
            }
        }
        Self { locations }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Indices of entries missing a canonical identifier. These are registry
    /// gaps needing manual attention and survive deduplication on purpose.
    pub fn gap_rows(&self) -> Vec<usize> {
        self.locations
            .iter()
            .enumerate()
            .filter(|(_, l)| l.canonical_id.is_empty())
            .map(|(i, _)| i)
            .collect()
    }
}

struct RegistryCache {
    conn: SqliteConnection,
}

impl RegistryCache {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating cache dir {}", parent.display()))?;
        }
        let conn = SqliteConnection::open(path)
            .with_context(|| format!("Failed opening cache DB {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS registry_cache (
                practice_id TEXT PRIMARY KEY,
                practice_cloud_id TEXT,
                payload_json TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                fetched_at_unix INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_registry_cache_status ON registry_cache(status);
            ",
        )
        .context("Failed initializing registry cache schema")?;
        Ok(Self { conn })
    }

    fn classify_for_lookup(&self, practice_ids: &[String]) -> Result<(usize, Vec<String>)> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM registry_cache WHERE practice_id = ?1")
            .context("Failed preparing registry cache lookup statement")?;

        let mut resolved = 0usize;
        let mut missing = Vec::new();

        for practice_id in practice_ids {
            let status: Option<String> = stmt
                .query_row([practice_id], |row| row.get(0))
                .optional()
                .with_context(|| format!("Failed registry cache lookup for {practice_id}"))?;

            match status.as_deref() {
                Some("ok") | Some("not_found") => resolved += 1,
                Some(_) | None => missing.push(practice_id.clone()),
            }
        }

        Ok((resolved, missing))
    }

    fn upsert_ok(
        &self,
        practice_id: &str,
        cloud_id: &str,
        records: &[RegistryRecord],
    ) -> Result<()> {
        let payload = serde_json::to_string(records)
            .with_context(|| format!("Failed encoding registry payload for {practice_id}"))?;
        self.upsert(practice_id, Some(cloud_id), Some(&payload), "ok", None)
    }

    fn upsert_not_found(&self, practice_id: &str) -> Result<()> {
        self.upsert(practice_id, None, None, "not_found", None)
    }

    fn upsert_error(&self, practice_id: &str, message: &str) -> Result<()> {
        self.upsert(practice_id, None, None, "error", Some(message))
    }

    fn upsert(
        &self,
        practice_id: &str,
        cloud_id: Option<&str>,
        payload_json: Option<&str>,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "
                INSERT INTO registry_cache
                    (practice_id, practice_cloud_id, payload_json, status, error_message, fetched_at_unix)
                VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s', 'now'))
                ON CONFLICT(practice_id) DO UPDATE SET
                    practice_cloud_id = excluded.practice_cloud_id,
                    payload_json = excluded.payload_json,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    fetched_at_unix = excluded.fetched_at_unix
                ",
                params![practice_id, cloud_id, payload_json, status, error_message],
            )
            .with_context(|| format!("Failed updating registry cache for {practice_id}"))?;
        Ok(())
    }

    /// Cached records for the requested practices, in request order, with
    /// the owning practice ID injected into each row.
    fn load_records(&self, practice_ids: &[String]) -> Result<Vec<RegistryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT payload_json FROM registry_cache WHERE practice_id = ?1 AND status = 'ok'",
            )
            .context("Failed preparing registry cache payload statement")?;

        let mut records = Vec::new();
        for practice_id in practice_ids {
            let payload: Option<String> = stmt
                .query_row([practice_id], |row| row.get(0))
                .optional()
                .with_context(|| format!("Failed loading cached registry rows for {practice_id}"))?;
            let Some(payload) = payload else { continue };
            let mut rows: Vec<RegistryRecord> = serde_json::from_str(&payload)
                .with_context(|| format!("Invalid cached registry payload for {practice_id}"))?;
            for row in &mut rows {
                row.practice_id = practice_id.clone();
            }
            records.extend(rows);
        }
        Ok(records)
    }
}

#[derive(Debug, Deserialize)]
struct PracticeIdResponse {
    #[serde(default)]
    practice_ids: Vec<PracticeIdPair>,
}

#[derive(Debug, Deserialize)]
struct PracticeIdPair {
    #[serde(default, deserialize_with = "stringish")]
    monolith_practice_id: String,
    #[serde(default, deserialize_with = "stringish")]
    practice_id: String,
}

#[derive(Debug, Deserialize)]
struct PracticeLocationsResponse {
    #[serde(default)]
    practice_locations: Vec<RegistryRecord>,
}

enum LocationFetchOutcome {
    Found(String, Vec<RegistryRecord>),
    NotFound,
}

/// Fetches (or re-loads from cache) the location registry for the given
/// practice IDs, returning every raw row in a stable practice order.
pub async fn build_registry_records(
    args: &Args,
    client: &Client,
    practice_ids: &[String],
    cache_db: &Path,
) -> Result<Vec<RegistryRecord>> {
    let cache = RegistryCache::open(cache_db)?;

    let (resolved_count, mut missing) = if args.rebuild_registry {
        (0, practice_ids.to_vec())
    } else {
        cache.classify_for_lookup(practice_ids)?
    };
    println!(
        "Registry cache status: {} practices resolved in cache, {} unresolved.",
        resolved_count,
        missing.len()
    );

    if let Some(limit) = args.max_new_lookups {
        if missing.len() > limit {
            println!(
                "Applying --max-new-lookups={} to registry fetches (from {}).",
                limit,
                missing.len()
            );
            missing.truncate(limit);
        }
    }

    if args.skip_api {
        println!("--skip-api set; unresolved practices remain unresolved.");
    } else if !missing.is_empty() {
        let cloud_ids = resolve_cloud_ids(client, &args.api_base_url, &missing).await?;
        fetch_missing_practices(&cache, missing, cloud_ids, client, args).await?;
    }

    cache.load_records(practice_ids)
}

/// One batch call mapping roster practice IDs to registry cloud IDs.
async fn resolve_cloud_ids(
    client: &Client,
    api_base_url: &str,
    practice_ids: &[String],
) -> Result<Vec<(String, String)>> {
    let url = format!("{}/{}", api_base_url.trim_end_matches('/'), PRACTICE_ID_BATCH_PATH);
    let body = serde_json::json!({ "monolith_practice_ids": practice_ids });
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .context("Practice ID batch request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "Practice ID batch request returned {}. Body: {}",
            status,
            truncate_for_log(&body)
        ));
    }
    let parsed: PracticeIdResponse = response
        .json()
        .await
        .context("Invalid practice ID batch JSON")?;
    Ok(parsed
        .practice_ids
        .into_iter()
        .filter(|pair| !pair.practice_id.is_empty())
        .map(|pair| (pair.monolith_practice_id, pair.practice_id))
        .collect())
}

async fn fetch_missing_practices(
    cache: &RegistryCache,
    missing: Vec<String>,
    cloud_ids: Vec<(String, String)>,
    client: &Client,
    args: &Args,
) -> Result<()> {
    let cloud_id_map: std::collections::HashMap<String, String> = cloud_ids.into_iter().collect();

    let mut queue = Vec::new();
    for practice_id in missing {
        match cloud_id_map.get(&practice_id) {
            Some(cloud_id) => queue.push((practice_id, cloud_id.clone())),
            None => cache.upsert_not_found(&practice_id)?,
        }
    }
    if queue.is_empty() {
        return Ok(());
    }

    let total = queue.len();
    let concurrency = args.concurrency.max(1);
    let min_interval = if args.requests_per_second == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / args.requests_per_second as f64)
    };
    let next_slot = Arc::new(Mutex::new(Instant::now()));

    let progress = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [registry {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message("fetching practice locations");

    let mut pending = queue.into_iter();
    let mut in_flight = FuturesUnordered::new();

    for _ in 0..concurrency {
        if let Some((practice_id, cloud_id)) = pending.next() {
            in_flight.push(fetch_practice(
                practice_id,
                cloud_id,
                client.clone(),
                args.api_base_url.clone(),
                args.max_retries.max(1),
                Arc::clone(&next_slot),
                min_interval,
            ));
        }
    }

    let mut found = 0usize;
    let mut not_found = 0usize;
    let mut failed = 0usize;

    while let Some((practice_id, result)) = in_flight.next().await {
        progress.inc(1);
        match result {
            Ok(LocationFetchOutcome::Found(cloud_id, records)) => {
                cache.upsert_ok(&practice_id, &cloud_id, &records)?;
                found += 1;
            }
            Ok(LocationFetchOutcome::NotFound) => {
                cache.upsert_not_found(&practice_id)?;
                not_found += 1;
            }
            Err(err) => {
                cache.upsert_error(&practice_id, &err.to_string())?;
                failed += 1;
            }
        }
        progress.set_message(format!("ok={found} not_found={not_found} failed={failed}"));

        if let Some((practice_id, cloud_id)) = pending.next() {
            in_flight.push(fetch_practice(
                practice_id,
                cloud_id,
                client.clone(),
                args.api_base_url.clone(),
                args.max_retries.max(1),
                Arc::clone(&next_slot),
                min_interval,
            ));
        }
    }

    progress.finish_with_message(format!(
        "done: ok={found} not_found={not_found} failed={failed}"
    ));
    Ok(())
}

async fn fetch_practice(
    practice_id: String,
    cloud_id: String,
    client: Client,
    api_base_url: String,
    max_retries: u32,
    next_slot: Arc<Mutex<Instant>>,
    min_interval: Duration,
) -> (String, Result<LocationFetchOutcome>) {
    wait_for_rate_slot(&next_slot, min_interval).await;
    let result = fetch_practice_locations(&client, &api_base_url, &cloud_id, max_retries).await;
    (practice_id, result)
}

async fn fetch_practice_locations(
    client: &Client,
    api_base_url: &str,
    cloud_id: &str,
    max_retries: u32,
) -> Result<LocationFetchOutcome> {
    let url = format!(
        "{}/{}",
        api_base_url.trim_end_matches('/'),
        PRACTICE_LOCATION_BATCH_PATH
    );
    let body = serde_json::json!({ "practice_ids": [cloud_id] });
    let attempts = max_retries.max(1);
    let mut backoff = Duration::from_secs(1);

    for attempt in 1..=attempts {
        let response = client.post(&url).json(&body).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let parsed: PracticeLocationsResponse = resp
                        .json()
                        .await
                        .with_context(|| format!("Invalid location JSON for practice {cloud_id}"))?;
                    return Ok(LocationFetchOutcome::Found(
                        cloud_id.to_string(),
                        parsed.practice_locations,
                    ));
                }
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Ok(LocationFetchOutcome::NotFound);
                }

                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                let body_text = resp.text().await.unwrap_or_default();
                if is_retryable_status(status) {
                    if attempt == attempts {
                        return Err(anyhow!(
                            "Location API retryable status {} for practice {} after {} attempts. Body: {}",
                            status,
                            cloud_id,
                            attempts,
                            truncate_for_log(&body_text)
                        ));
                    }
                    tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                    backoff = (backoff + backoff).min(Duration::from_secs(60));
                    continue;
                }

                return Err(anyhow!(
                    "Location API non-retryable status {} for practice {}. Body: {}",
                    status,
                    cloud_id,
                    truncate_for_log(&body_text)
                ));
            }
            Err(err) => {
                if attempt == attempts {
                    return Err(anyhow!(
                        "Location API request failed for practice {cloud_id}: {err}"
                    ));
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff + backoff).min(Duration::from_secs(60));
            }
        }
    }

    Err(anyhow!("Unexpected location API flow for {cloud_id}"))
}

/// Writes the raw registry rows to a CSV snapshot for auditing, via a temp
/// file swapped into place.
pub fn export_registry_csv(records: &[RegistryRecord], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed creating registry CSV directory {}", parent.display())
        })?;
    }

    let file_name = output_path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("registry_snapshot.csv");
    let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp registry CSV {}", tmp_path.display()))?;
    writer
        .write_record([
            "practice_id",
            "is_virtual",
            "address_1",
            "address_2",
            "city",
            "state",
            "zip",
            "location_id",
            "monolith_location_id",
            "software",
            "software_id",
            "phone",
            "virtual_visit_type",
        ])
        .context("Failed writing registry CSV header")?;

    for record in records {
        let is_virtual = match &record.is_virtual {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        writer
            .write_record([
                record.practice_id.as_str(),
                is_virtual.as_str(),
                record.address_1.as_str(),
                record.address_2.as_str(),
                record.city.as_str(),
                record.state.as_str(),
                record.zip.as_str(),
                record.location_id.as_str(),
                record.monolith_location_id.as_str(),
                record.software.as_str(),
                record.software_id.as_str(),
                record.phone.as_str(),
                record.virtual_visit_type.as_str(),
            ])
            .context("Failed writing registry CSV row")?;
    }
    writer.flush().context("Failed flushing registry CSV")?;

    fs::rename(&tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving temp registry CSV {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })?;
    Ok(())
}
