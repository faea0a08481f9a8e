use std::path::PathBuf;

use rocket::figment::Figment;
use serde::{Deserialize, Serialize};

use crate::preprocess::MAX_IMAGE_SIDE;
use crate::segmentation::{CellNetConfig, EvalParams, ModelKind};

/// Key of the service table in `Rocket.toml` / `ROCKET_CELLCOUNT`.
pub const CONFIG_KEY: &str = "cellcount";

/// Service settings, read from Rocket's figment under [`CONFIG_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub model_type: ModelKind,
    /// Local safetensors file for `cellnet`; takes precedence over the hub.
    pub weights_path: Option<PathBuf>,
    /// Hugging Face repo holding `weights_file`.
    pub weights_repo: Option<String>,
    pub weights_file: String,
    pub hidden_channels: usize,
    pub depth: usize,
    pub max_image_side: u32,
    pub upload_limit_mib: u64,
    pub eval: EvalParams,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let net = CellNetConfig::default();
        Self {
            model_type: ModelKind::default(),
            weights_path: None,
            weights_repo: None,
            weights_file: "cellnet.safetensors".to_string(),
            hidden_channels: net.hidden,
            depth: net.depth,
            max_image_side: MAX_IMAGE_SIDE,
            upload_limit_mib: 64,
            eval: EvalParams::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_figment(figment: &Figment) -> Result<Self, rocket::figment::Error> {
        figment.focus(CONFIG_KEY).extract()
    }

    pub fn cellnet(&self) -> CellNetConfig {
        CellNetConfig {
            hidden: self.hidden_channels,
            depth: self.depth,
        }
    }

    pub fn upload_limit_bytes(&self) -> u64 {
        self.upload_limit_mib.saturating_mul(1024 * 1024)
    }
}
