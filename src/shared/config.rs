//! Application configuration. Endpoint URLs, credentials, tuning knobs.

use serde::Deserialize;

/// Default analysis worker-pool cap. The effective pool size is
/// min(cap, image count).
pub const DEFAULT_ANALYSIS_WORKERS: usize = 3;

/// Default attempt cap for the bounded-retry wrapper around inventory calls.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    /// Vision detection endpoint base URL. Read from INV_SCAN_VISION_API_URL.
    #[serde(default)]
    pub vision_api_url: Option<String>,

    /// Vision API key. Read from INV_SCAN_VISION_API_KEY.
    #[serde(default)]
    pub vision_api_key: Option<String>,

    /// Inventory store base URL. Read from INV_SCAN_INVENTORY_API_URL.
    #[serde(default)]
    pub inventory_api_url: Option<String>,

    /// Inventory access token. Read from INV_SCAN_INVENTORY_API_TOKEN.
    #[serde(default)]
    pub inventory_api_token: Option<String>,

    /// Target location id for created items. Read from INV_SCAN_LOCATION_ID.
    #[serde(default)]
    pub location_id: Option<String>,

    /// Optional parent item id. Read from INV_SCAN_PARENT_ITEM_ID.
    #[serde(default)]
    pub parent_item_id: Option<String>,

    /// Analysis worker-pool cap. Read from INV_SCAN_ANALYSIS_WORKERS.
    #[serde(default)]
    pub analysis_workers: Option<usize>,

    /// Attempt cap for create/upload/merge/delete calls. Read from
    /// INV_SCAN_RETRY_ATTEMPTS.
    #[serde(default)]
    pub retry_attempts: Option<usize>,

    /// Run AI enrichment over detected items after analysis. Read from
    /// INV_SCAN_AUTO_ENRICH.
    #[serde(default)]
    pub auto_enrich: Option<bool>,

    /// Use the grouped-detection endpoint instead of per-image detection.
    /// Read from INV_SCAN_GROUPED_MODE.
    #[serde(default)]
    pub grouped_mode: Option<bool>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        c = c.add_source(config::Environment::with_prefix("INV_SCAN"));
        if let Ok(path) = std::env::var("INV_SCAN_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        let cfg: Self = c.build()?.try_deserialize()?;
        Ok(cfg)
    }

    /// Returns the analysis worker cap. Defaults to DEFAULT_ANALYSIS_WORKERS.
    pub fn analysis_workers_or_default(&self) -> usize {
        self.analysis_workers
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_ANALYSIS_WORKERS)
    }

    /// Returns the retry attempt cap. Defaults to DEFAULT_RETRY_ATTEMPTS.
    pub fn retry_attempts_or_default(&self) -> usize {
        self.retry_attempts
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
    }

    /// Returns true when AI enrichment should run after analysis.
    pub fn auto_enrich_or_default(&self) -> bool {
        self.auto_enrich.unwrap_or(false)
    }

    /// Returns true when the grouped-detection endpoint should be used.
    pub fn grouped_mode_or_default(&self) -> bool {
        self.grouped_mode.unwrap_or(false)
    }

    /// Returns true if the vision endpoint is configured.
    pub fn is_vision_configured(&self) -> bool {
        self.vision_api_url.is_some()
    }

    /// Returns true if the inventory endpoint is configured.
    pub fn is_inventory_configured(&self) -> bool {
        self.inventory_api_url.is_some() && self.inventory_api_token.is_some()
    }
}
