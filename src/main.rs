//! Wiring & DI. Entry point for the headless batch flow: analyze the given
//! image files, confirm every detection, submit to the inventory store.
//! No business logic here; the workflow coordinator owns the phase machine.

use dotenv::dotenv;
use inv_scan::adapters::inventory::{HttpInventoryAdapter, MockInventoryAdapter};
use inv_scan::adapters::vision::{HttpVisionAdapter, MockVisionAdapter};
use inv_scan::domain::{CapturedImage, WorkflowPhase};
use inv_scan::ports::{InventoryPort, VisionPort};
use inv_scan::shared::config::AppConfig;
use inv_scan::usecases::ScanWorkflow;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_loaded = dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!("no .env found"),
    }

    let cfg = AppConfig::load().unwrap_or_default();
    let image_paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if image_paths.is_empty() {
        anyhow::bail!("usage: inv-scan <image file>...");
    }

    // --- Ports: HTTP adapters when configured, mocks otherwise ---
    let vision: Arc<dyn VisionPort> = if let Some(url) = cfg.vision_api_url.clone() {
        Arc::new(HttpVisionAdapter::new(
            url,
            cfg.vision_api_key.clone().unwrap_or_default(),
        ))
    } else {
        info!("vision endpoint not configured; using mock adapter");
        Arc::new(MockVisionAdapter::new())
    };
    let inventory: Arc<dyn InventoryPort> = match (
        cfg.inventory_api_url.clone(),
        cfg.inventory_api_token.clone(),
    ) {
        (Some(url), Some(token)) => Arc::new(HttpInventoryAdapter::new(url, token)),
        _ => {
            info!("inventory endpoint not configured; using mock adapter");
            Arc::new(MockInventoryAdapter::new())
        }
    };

    let location = cfg.location_id.clone().unwrap_or_else(|| {
        info!("INV_SCAN_LOCATION_ID not set; using \"inbox\"");
        "inbox".to_string()
    });

    let workflow = ScanWorkflow::new(vision, inventory, &cfg);
    workflow.begin().await?;
    workflow
        .select_location(location, cfg.parent_item_id.clone())
        .await?;
    for path in &image_paths {
        workflow.add_image(CapturedImage::new(path.clone())).await?;
    }

    info!(images = image_paths.len(), "starting analysis");
    workflow.start_analysis(cfg.grouped_mode_or_default()).await?;

    match workflow.phase().await {
        WorkflowPhase::Reviewing => {}
        WorkflowPhase::PartialAnalysis => {
            warn!(
                failed = workflow.analysis_failed_count().await,
                "some images failed; continuing with successful detections"
            );
            workflow.continue_with_successful().await?;
        }
        WorkflowPhase::Grouping => {
            let groups = workflow.groups().await;
            info!(groups = groups.len(), "accepting detected grouping as-is");
            workflow.confirm_grouping(groups).await?;
        }
        WorkflowPhase::Capturing => {
            anyhow::bail!(
                "analysis failed: {}",
                workflow.error().await.unwrap_or_default()
            );
        }
        other => anyhow::bail!("unexpected phase after analysis: {other}"),
    }

    let detected = workflow.detected_items().await;
    info!(items = detected.len(), "confirming all detected items");
    workflow.confirm_all_remaining(None).await?;

    info!("submitting");
    workflow.submit().await?;
    match workflow.phase().await {
        WorkflowPhase::Complete => {
            if let Some(result) = workflow.last_result().await {
                info!(
                    items = result.item_count,
                    photos = result.photo_count,
                    labels = result.label_count,
                    names = ?result.item_names,
                    "submission complete"
                );
            }
        }
        WorkflowPhase::Submitting => {
            let statuses = workflow.item_statuses().await;
            warn!(
                statuses = ?statuses,
                "some items failed to submit; re-run to retry the failed subset"
            );
        }
        _ => {
            anyhow::bail!(
                "submission failed: {}",
                workflow.error().await.unwrap_or_default()
            );
        }
    }

    Ok(())
}
