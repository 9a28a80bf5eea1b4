//! Converting card images to `data:` URLs for the chat API.

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::prelude::*;

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    format!("data:{mime_type};base64,{base64_data}")
}

/// Read an image file and encode it as a `data:` URL, guessing the MIME type
/// from the file extension.
pub async fn image_data_url(path: &Path) -> Result<String> {
    let mime_type = mime_guess::from_path(path).first_or_octet_stream();
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(data_url(mime_type.essence_str(), &data))
}
