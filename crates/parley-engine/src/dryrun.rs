use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use parley_contracts::conversation::ImageData;
use sha2::{Digest, Sha256};

use crate::service::{
    ChunkStream, GenerativeService, ImageGenerationRequest, ServiceReply, TextRequest,
    VisionRequest,
};

const DRYRUN_IMAGE_SIZE: u32 = 64;

/// Offline service with deterministic replies.
pub struct DryrunService;

impl DryrunService {
    fn reply_text(request: &TextRequest) -> String {
        let prompt = request.prompt.trim();
        if request.history.is_empty() {
            format!("Echo: {prompt}")
        } else {
            format!(
                "Echo: {prompt} ({} earlier turns)",
                request.history.len()
            )
        }
    }
}

impl GenerativeService for DryrunService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn has_credentials(&self) -> bool {
        true
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        Ok(Self::reply_text(request))
    }

    fn stream_text(&self, request: &TextRequest) -> Result<ChunkStream> {
        let chunks = Self::reply_text(request)
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<Result<String>>>();
        Ok(Box::new(chunks.into_iter()))
    }

    fn generate_image(&self, request: &ImageGenerationRequest) -> Result<ServiceReply> {
        let bytes = render_dryrun_png(&request.prompt)?;
        Ok(ServiceReply {
            text: format!("Dry-run image {}", short_id(&request.prompt)),
            image: Some(ImageData::from_bytes("image/png", &bytes)),
        })
    }

    fn understand_image(&self, request: &VisionRequest) -> Result<ServiceReply> {
        let bytes = request.image.decode()?;
        let text = match image::load_from_memory(&bytes) {
            Ok(decoded) => format!(
                "A {}x{} {} image. {}",
                decoded.width(),
                decoded.height(),
                request.image.mime_type,
                request.prompt.trim()
            ),
            Err(_) => format!(
                "An image of {} bytes. {}",
                bytes.len(),
                request.prompt.trim()
            ),
        };
        Ok(ServiceReply {
            text: text.trim_end().to_string(),
            image: None,
        })
    }
}

fn render_dryrun_png(prompt: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(DRYRUN_IMAGE_SIZE, DRYRUN_IMAGE_SIZE);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode dry-run image")?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use parley_contracts::conversation::{ImageData, Role};
    use parley_contracts::turn::HistoryTurn;

    use super::{color_from_prompt, DryrunService};
    use crate::service::{GenerativeService, ImageGenerationRequest, TextRequest, VisionRequest};

    #[test]
    fn stream_chunks_concatenate_to_reply() -> anyhow::Result<()> {
        let service = DryrunService;
        let request = TextRequest::single("dryrun-text-1", "hello there");
        let chunks = service
            .stream_text(&request)?
            .collect::<anyhow::Result<Vec<String>>>()?;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), service.generate_text(&request)?);
        assert_eq!(chunks.concat(), "Echo: hello there");
        Ok(())
    }

    #[test]
    fn reply_mentions_history_length() -> anyhow::Result<()> {
        let mut request = TextRequest::single("dryrun-text-1", "again");
        request.history.push(HistoryTurn {
            role: Role::User,
            text: "first".to_string(),
        });
        assert_eq!(
            DryrunService.generate_text(&request)?,
            "Echo: again (1 earlier turns)"
        );
        Ok(())
    }

    #[test]
    fn generated_image_is_decodable_and_deterministic() -> anyhow::Result<()> {
        let service = DryrunService;
        let request = ImageGenerationRequest {
            model: "dryrun-image-1".to_string(),
            prompt: "a red fox".to_string(),
        };
        let first = service.generate_image(&request)?;
        let second = service.generate_image(&request)?;
        assert_eq!(first, second);

        let image = first.image.ok_or_else(|| anyhow::anyhow!("missing image"))?;
        let decoded = image::load_from_memory(&image.decode()?)?.to_rgb8();
        let (r, g, b) = color_from_prompt("a red fox");
        assert_eq!(decoded.get_pixel(0, 0).0, [r, g, b]);
        Ok(())
    }

    #[test]
    fn understanding_reports_dimensions() -> anyhow::Result<()> {
        let service = DryrunService;
        let generated = service.generate_image(&ImageGenerationRequest {
            model: "dryrun-image-1".to_string(),
            prompt: "square".to_string(),
        })?;
        let image = generated
            .image
            .ok_or_else(|| anyhow::anyhow!("missing image"))?;
        let reply = service.understand_image(&VisionRequest {
            model: "dryrun-text-1".to_string(),
            prompt: "Describe this image.".to_string(),
            image,
            allow_image_output: false,
        })?;
        assert_eq!(reply.text, "A 64x64 image/png image. Describe this image.");

        let opaque = service.understand_image(&VisionRequest {
            model: "dryrun-text-1".to_string(),
            prompt: String::new(),
            image: ImageData::from_bytes("image/heic", &[1, 2, 3]),
            allow_image_output: false,
        })?;
        assert_eq!(opaque.text, "An image of 3 bytes.");
        Ok(())
    }
}
