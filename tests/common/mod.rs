#![allow(dead_code)]

pub mod synthetic_image {
    use std::io::Cursor;

    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Dark background with bright disks of radius `r`, plus optional noise.
    pub fn disks(
        width: u32,
        height: u32,
        centres: &[(f32, f32)],
        r: f32,
        noise: u8,
    ) -> DynamicImage {
        let mut rng = StdRng::seed_from_u64(7);
        let img = GrayImage::from_fn(width, height, |x, y| {
            let inside = centres
                .iter()
                .any(|&(cx, cy)| (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2) <= r * r);
            let base: u8 = if inside { 210 } else { 20 };
            let jitter = if noise > 0 { rng.gen_range(0..=noise) } else { 0 };
            Luma([base.saturating_add(jitter)])
        });
        DynamicImage::ImageLuma8(img)
    }

    /// Same picture with dark cells on a bright background.
    pub fn inverted(mut image: DynamicImage) -> DynamicImage {
        image.invert();
        image
    }

    pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }
}

pub mod multipart {
    use rocket::http::ContentType;

    pub const BOUNDARY: &str = "cellcount-test-boundary";

    /// One-file multipart body.
    pub fn file_body(field: &str, filename: &str, mime: &str, bytes: &[u8]) -> (ContentType, Vec<u8>) {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        (content_type(), body)
    }

    /// Multipart body with a single text field.
    pub fn text_body(field: &str, value: &str) -> (ContentType, Vec<u8>) {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n--{BOUNDARY}--\r\n"
        )
        .into_bytes();
        (content_type(), body)
    }

    fn content_type() -> ContentType {
        ContentType::new("multipart", "form-data").with_params(("boundary", BOUNDARY))
    }
}
