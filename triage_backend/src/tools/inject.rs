use serde_json::Value;

use super::{required_attachment, ToolArguments};
use crate::context::{encode_base64, AttachedContext, AttachmentKind};

pub const AUDIO_PAYLOAD_KEY: &str = "audio_data";
pub const IMAGE_PAYLOAD_KEY: &str = "image_data";

fn payload_key(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Audio => AUDIO_PAYLOAD_KEY,
        AttachmentKind::Image => IMAGE_PAYLOAD_KEY,
    }
}

/// Fill a media tool's arguments with the attachment it analyses.
///
/// Non-media tools get their arguments back untouched. A media tool whose
/// attachment is missing is also left alone; the remote tool reports that
/// it received no data.
pub fn inject_context(
    tool_name: &str,
    arguments: &ToolArguments,
    context: &AttachedContext,
) -> ToolArguments {
    let mut arguments = arguments.clone();
    let Some(kind) = required_attachment(tool_name) else {
        return arguments;
    };
    match context.get(kind) {
        Some(bytes) => {
            tracing::debug!(
                "Injecting {:?} payload ({} bytes) into {}",
                kind,
                bytes.len(),
                tool_name
            );
            arguments.insert(
                payload_key(kind).to_string(),
                Value::String(encode_base64(bytes)),
            );
        }
        None => {
            tracing::warn!(
                "{} requested without a {:?} attachment; dispatching without payload",
                tool_name,
                kind
            );
        }
    }
    arguments
}
