use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: String,
    pub model: String,
    pub max_image_side: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub cell_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
