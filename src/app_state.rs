use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use hf_hub::api::sync::Api;
use rocket::fairing::AdHoc;

use crate::config::ServiceConfig;
use crate::counter::CellCounter;
use crate::segmentation::{CellNetModel, ModelKind, SegmentationModel, ThresholdModel};

/// 全局共享状态：
/// - counter: 已加载的模型 + 固定的推理参数
/// - config: 启动时读到的配置，/health 会用到
///
/// Built once at ignition and never mutated.
pub struct AppState {
    pub counter: CellCounter,
    pub config: ServiceConfig,
}

impl AppState {
    pub fn new(model: Arc<dyn SegmentationModel>, config: ServiceConfig) -> Self {
        let counter = CellCounter::new(model, config.eval.clone(), config.max_image_side);
        Self { counter, config }
    }
}

/// Build the configured back end. CPU only.
pub fn load_model(config: &ServiceConfig) -> anyhow::Result<Arc<dyn SegmentationModel>> {
    let model: Arc<dyn SegmentationModel> = match config.model_type {
        ModelKind::Threshold => Arc::new(ThresholdModel::new()),
        ModelKind::Cellnet => {
            let weights = resolve_weights(config)?;
            Arc::new(CellNetModel::load(&weights, config.cellnet())?)
        }
    };
    Ok(model)
}

/// Local weights path, or download `weights_file` from `weights_repo`.
fn resolve_weights(config: &ServiceConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.weights_path {
        return Ok(path.clone());
    }
    let repo = config
        .weights_repo
        .as_deref()
        .ok_or_else(|| anyhow!("model_type `cellnet` needs `weights_path` or `weights_repo`"))?;

    let api = Api::new()?;
    let api = api.model(repo.to_string());
    let path = api
        .get(&config.weights_file)
        .with_context(|| format!("fetching {} from {}", config.weights_file, repo))?;
    Ok(path)
}

/// Loads the model during ignition and manages [`AppState`].
///
/// A bad config or a failed load aborts launch.
pub fn fairing() -> AdHoc {
    AdHoc::try_on_ignite("Segmentation Model", |rocket| async move {
        let config = match ServiceConfig::from_figment(rocket.figment()) {
            Ok(config) => config,
            Err(e) => {
                log::error!("invalid `{}` configuration: {}", crate::config::CONFIG_KEY, e);
                return Err(rocket);
            }
        };

        // 加载可能要下载权重，不要卡住 async runtime
        let start = Instant::now();
        let loader = config.clone();
        let loaded = tokio::task::spawn_blocking(move || load_model(&loader)).await;
        match loaded {
            Ok(Ok(model)) => {
                log::info!(
                    "segmentation model `{}` ready in {:.2}s",
                    model.name(),
                    start.elapsed().as_secs_f32()
                );
                Ok(rocket.manage(AppState::new(model, config)))
            }
            Ok(Err(e)) => {
                log::error!("failed to load segmentation model: {:#}", e);
                Err(rocket)
            }
            Err(e) => {
                log::error!("model loader panicked: {}", e);
                Err(rocket)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_model_needs_no_weights() {
        let model = load_model(&ServiceConfig::default()).unwrap();
        assert_eq!(model.name(), "threshold");
    }

    #[test]
    fn cellnet_without_weights_source_fails() {
        let config = ServiceConfig {
            model_type: ModelKind::Cellnet,
            ..Default::default()
        };
        let err = load_model(&config).err().unwrap();
        assert!(err.to_string().contains("weights_path"));
    }

    #[test]
    fn cellnet_with_missing_file_fails() {
        let config = ServiceConfig {
            model_type: ModelKind::Cellnet,
            weights_path: Some(PathBuf::from("/nonexistent/cellnet.safetensors")),
            ..Default::default()
        };
        assert!(load_model(&config).is_err());
    }
}
