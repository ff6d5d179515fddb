//! Image attachments read from disk.

use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use moe_coordination::ImageInput;

/// Read `path` and encode it inline. The MIME type comes from the file
/// extension and must be an `image/*` type.
pub fn load_image(path: &Path) -> Result<ImageInput> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() != "image" {
        bail!("{} is not a recognised image type ({mime})", path.display());
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(encode_image(mime.essence_str(), &bytes))
}

pub fn encode_image(mime_type: &str, bytes: &[u8]) -> ImageInput {
    ImageInput {
        mime_type: mime_type.to_string(),
        data_base64: STANDARD.encode(bytes),
    }
}
