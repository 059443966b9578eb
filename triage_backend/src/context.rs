//! Binary attachments supplied once per consultation.

use anyhow::{Context, Result};
use base64::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Audio,
    Image,
}

/// Audio and image bytes attached to a single run. Read-only to the agent loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachedContext {
    audio: Option<Vec<u8>>,
    image: Option<Vec<u8>>,
}

impl AttachedContext {
    pub fn new(audio: Option<Vec<u8>>, image: Option<Vec<u8>>) -> Self {
        Self {
            audio: audio.filter(|bytes| !bytes.is_empty()),
            image: image.filter(|bytes| !bytes.is_empty()),
        }
    }

    pub fn with_audio(mut self, bytes: Vec<u8>) -> Self {
        self.audio = Some(bytes).filter(|bytes| !bytes.is_empty());
        self
    }

    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.image = Some(bytes).filter(|bytes| !bytes.is_empty());
        self
    }

    /// Decode base64 attachments as they arrive over the API.
    pub fn from_base64(audio: Option<&str>, image: Option<&str>) -> Result<Self> {
        let audio = audio
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| decode_base64(raw).context("Invalid base64 in audio attachment"))
            .transpose()?;
        let image = image
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| decode_base64(raw).context("Invalid base64 in image attachment"))
            .transpose()?;
        Ok(Self::new(audio, image))
    }

    pub fn audio(&self) -> Option<&[u8]> {
        self.audio.as_deref()
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    pub fn get(&self, kind: AttachmentKind) -> Option<&[u8]> {
        match kind {
            AttachmentKind::Audio => self.audio(),
            AttachmentKind::Image => self.image(),
        }
    }

    pub fn has(&self, kind: AttachmentKind) -> bool {
        self.get(kind).is_some()
    }
}

/// Standard alphabet with padding, the encoding every remote media tool expects.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(raw: &str) -> Result<Vec<u8>> {
    // Accept data URIs pasted straight from a browser upload.
    let payload = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("Failed to decode base64 payload")
}
