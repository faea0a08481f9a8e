mod common;

use common::multipart::{file_body, text_body};
use std::time::Duration;

use cellcount::lifecycle::{Lifecycle, ServerState};
use common::synthetic_image::{disks, encode, inverted};
use image::ImageFormat;
use rocket::fairing::AdHoc;
use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;
use rocket::tokio::io::{AsyncReadExt, AsyncWriteExt};
use rocket::tokio::net::TcpStream;
use rocket::tokio::sync::oneshot;
use serde_json::Value;

fn client() -> Client {
    let figment = rocket::Config::figment()
        .merge(("cellcount.model_type", "threshold"))
        .merge(("log_level", "critical"));
    Client::tracked(cellcount::rocket_from(figment)).expect("valid rocket instance")
}

fn post_file(client: &Client, field: &str, mime: &str, bytes: &[u8]) -> (Status, Value) {
    let (ct, body) = file_body(field, "upload.bin", mime, bytes);
    let response = client.post("/count_cells").header(ct).body(body).dispatch();
    let status = response.status();
    let json = response.into_json::<Value>().expect("json body");
    (status, json)
}

#[test]
fn counts_cells_in_uploaded_png() {
    let client = client();
    let image = disks(200, 160, &[(40.0, 40.0), (140.0, 50.0), (90.0, 120.0)], 14.0, 0);
    let (status, json) = post_file(&client, "image", "image/png", &encode(&image, ImageFormat::Png));
    assert_eq!(status, Status::Ok);
    assert_eq!(json["cell_count"], 3);
}

#[test]
fn counts_dark_cells_on_bright_background() {
    let client = client();
    let image = inverted(disks(200, 200, &[(50.0, 50.0), (150.0, 60.0), (100.0, 150.0)], 16.0, 0));
    let (status, json) = post_file(&client, "image", "image/png", &encode(&image, ImageFormat::Png));
    assert_eq!(status, Status::Ok);
    assert_eq!(json["cell_count"], 3);
}

#[test]
fn large_noisy_upload_is_downsampled_and_counted() {
    let client = client();
    let centres = [(100.0, 100.0), (400.0, 120.0), (250.0, 300.0), (650.0, 350.0)];
    let image = disks(800, 480, &centres, 40.0, 12);
    let (status, json) = post_file(&client, "image", "image/png", &encode(&image, ImageFormat::Png));
    assert_eq!(status, Status::Ok);
    assert_eq!(json["cell_count"], 4);
}

#[test]
fn blank_image_has_zero_cells() {
    let client = client();
    let image = disks(64, 64, &[], 1.0, 0);
    let (status, json) = post_file(&client, "image", "image/png", &encode(&image, ImageFormat::Png));
    assert_eq!(status, Status::Ok);
    assert_eq!(json["cell_count"], 0);
}

#[test]
fn missing_image_field_is_a_bad_request() {
    let client = client();
    let image = disks(32, 32, &[(16.0, 16.0)], 8.0, 0);
    let (status, json) = post_file(&client, "picture", "image/png", &encode(&image, ImageFormat::Png));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(json["error"], "No image file provided.");
}

#[test]
fn request_without_form_is_a_bad_request() {
    let client = client();
    let response = client.post("/count_cells").dispatch();
    assert_eq!(response.status(), Status::BadRequest);
    let json = response.into_json::<Value>().unwrap();
    assert_eq!(json["error"], "No image file provided.");

    let response = client
        .post("/count_cells")
        .header(ContentType::JSON)
        .body(r#"{"image": "x"}"#)
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn corrupt_file_is_a_server_error() {
    let client = client();
    let (status, json) = post_file(&client, "image", "image/png", b"\x89PNG\r\n\x1a\nnot really");
    assert_eq!(status, Status::InternalServerError);
    assert!(!json["error"].as_str().unwrap().is_empty());

    let (ct, body) = text_body("image", "hello");
    let response = client.post("/count_cells").header(ct).body(body).dispatch();
    assert_eq!(response.status(), Status::InternalServerError);
}

#[test]
fn shutdown_acknowledges() {
    let client = client();
    let response = client.post("/shutdown").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let json = response.into_json::<Value>().unwrap();
    assert_eq!(json["message"], "Server shutting down...");
}

async fn post_shutdown(port: u16) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(b"POST /shutdown HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}

#[rocket::async_test]
async fn shutdown_route_stops_a_running_server() {
    let figment = rocket::Config::figment()
        .merge(("address", "127.0.0.1"))
        .merge(("port", 0))
        .merge(("log_level", "critical"))
        .merge(("shutdown.grace", 1))
        .merge(("shutdown.mercy", 1))
        .merge(("cellcount.model_type", "threshold"));

    let (tx, rx) = oneshot::channel();
    let rocket = cellcount::rocket_from(figment).attach(AdHoc::on_liftoff("Shutdown Caller", |rocket| {
        let port = rocket.config().port;
        Box::pin(async move {
            rocket::tokio::spawn(async move {
                let _ = tx.send(post_shutdown(port).await);
            });
        })
    }));

    let stopped = rocket::tokio::time::timeout(Duration::from_secs(30), rocket.launch())
        .await
        .expect("server stops after POST /shutdown")
        .expect("graceful shutdown");

    let reply = rx.await.expect("caller ran").expect("request sent");
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(reply.contains("Server shutting down..."));

    let lifecycle = stopped.state::<Lifecycle>().expect("lifecycle is managed");
    assert_eq!(lifecycle.state(), ServerState::Terminated);
}

#[test]
fn health_reports_model() {
    let client = client();
    let response = client.get("/health").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let json = response.into_json::<Value>().unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "threshold");
    assert_eq!(json["max_image_side"], 256);
    assert!(json["state"].is_string());
}

#[test]
fn unknown_routes_answer_json() {
    let client = client();
    let response = client.get("/nope").dispatch();
    assert_eq!(response.status(), Status::NotFound);
    let json = response.into_json::<Value>().unwrap();
    assert_eq!(json["error"], "Not Found");
}

#[test]
fn cellnet_without_weights_fails_to_ignite() {
    let figment = rocket::Config::figment()
        .merge(("cellcount.model_type", "cellnet"))
        .merge(("log_level", "off"));
    let err = Client::tracked(cellcount::rocket_from(figment))
        .err()
        .expect("ignition should fail without weights");
    assert!(!err.to_string().is_empty());
}
