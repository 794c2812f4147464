pub const DEFAULT_REGISTRY_API_BASE_URL: &str =
    "https://provider-reference-v1.east.zocdoccloud.com/provider-reference/v1";

pub const PRACTICE_ID_BATCH_PATH: &str = "practice/ids-by-monolith-ids~batchGet";
pub const PRACTICE_LOCATION_BATCH_PATH: &str = "practice/location~batchGet";
