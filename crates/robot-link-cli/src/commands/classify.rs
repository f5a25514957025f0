use std::path::Path;

use bytes::Bytes;
use colored::Colorize;

use robot_link::capture::reencode_jpeg;
use robot_link::{InferenceClient, LinkConfig, LinkError, LinkResult};

use crate::app::print_prediction;

const JPEG_MAGIC: [u8; 2] = [0xff, 0xd8];

/// Upload a local image to the inference endpoint, bypassing any session.
pub async fn cmd_classify(config: &LinkConfig, image: &Path, json: bool) -> LinkResult<()> {
    let client = InferenceClient::new(&config.inference)?;
    let jpeg = read_as_jpeg(image).await?;

    println!("{} {}", "Classifying".bright_blue(), image.display());
    let prediction = client.classify(jpeg).await?;
    print_prediction(&prediction, json);
    Ok(())
}

/// JPEG files are sent unchanged; anything else is re-encoded.
async fn read_as_jpeg(path: &Path) -> LinkResult<Bytes> {
    let data = tokio::fs::read(path).await?;
    if data.starts_with(&JPEG_MAGIC) {
        return Ok(Bytes::from(data));
    }
    tokio::task::spawn_blocking(move || reencode_jpeg(&data))
        .await
        .map_err(|e| LinkError::Image(format!("re-encode task failed: {e}")))?
}
