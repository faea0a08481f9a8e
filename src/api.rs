use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::tokio::io::AsyncReadExt;
use rocket::{catch, get, post, FromForm, Request, Shutdown, State};

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::lifecycle::Lifecycle;
use crate::types::{CountResponse, ErrorResponse, HealthResponse, MessageResponse};

#[derive(FromForm)]
pub struct ImageUpload<'r> {
    pub image: Option<TempFile<'r>>,
}

#[get("/health")]
pub async fn health(state: &State<AppState>, lifecycle: &State<Lifecycle>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        state: lifecycle.state().to_string(),
        model: state.config.model_type.as_str().to_string(),
        max_image_side: state.config.max_image_side,
    })
}

#[post("/count_cells", data = "<upload>")]
pub async fn count_cells(
    state: &State<AppState>,
    upload: Form<ImageUpload<'_>>,
) -> Result<Json<CountResponse>, ApiError> {
    let file = upload.into_inner().image.ok_or(ApiError::MissingImage)?;
    let bytes = read_upload(&file).await?;
    log::debug!(
        "upload: {} bytes, content type {:?}",
        bytes.len(),
        file.content_type().map(|ct| ct.to_string())
    );

    let count = state.counter.count(bytes).await?;
    Ok(Json(CountResponse {
        cell_count: count as u64,
    }))
}

/// 不是表单的请求：同样当作没有 image
#[post("/count_cells", rank = 2)]
pub fn count_cells_without_form() -> ApiError {
    ApiError::MissingImage
}

#[post("/shutdown")]
pub fn shutdown(shutdown: Shutdown) -> Json<MessageResponse> {
    log::warn!("shutdown requested over HTTP");
    // 只是发通知，等这个响应发完 Rocket 才会真正停
    shutdown.notify();
    Json(MessageResponse {
        message: "Server shutting down...".to_string(),
    })
}

#[catch(default)]
pub fn default_catcher(status: Status, req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    log::warn!("{} {} -> {}", req.method(), req.uri(), status);
    (
        status,
        Json(ErrorResponse {
            error: status.reason().unwrap_or("Unknown error").to_string(),
        }),
    )
}

async fn read_upload(file: &TempFile<'_>) -> Result<Vec<u8>, ApiError> {
    let reader = file
        .open()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))?;
    rocket::tokio::pin!(reader);
    let mut bytes = Vec::with_capacity(file.len() as usize);
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(bytes)
}
