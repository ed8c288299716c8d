//! Video creation request body

use common::MediaInfo;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::types::VideoOptions;

/// Upscale models the service accepts. Unknown ids fall back to the first.
const UPSCALE_MODELS: &[&str] = &[
    "prob-4", "ahq-12", "amq-13", "alq-13", "nyx-3", "nxf-1", "rhea-1", "ghq-5", "gcg-5",
];

/// Frame interpolation models.
const INTERPOLATION_MODELS: &[&str] = &["apo-8", "apf-2", "chr-2", "chf-3"];

/// Parse "WIDTHxHEIGHT".
pub fn parse_resolution(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Output resolution: configured size, swapped when the input's orientation
/// (portrait vs landscape) differs from the configured one.
pub fn output_resolution(source: &MediaInfo, configured: (u32, u32)) -> (u32, u32) {
    let (width, height) = configured;
    let configured_portrait = height > width;
    if source.is_portrait() != configured_portrait {
        (height, width)
    } else {
        (width, height)
    }
}

/// Filter chain: the upscale model, then the optional interpolation model.
pub fn filters(options: &VideoOptions) -> Vec<Value> {
    let model = if UPSCALE_MODELS.contains(&options.model.as_str()) {
        options.model.as_str()
    } else {
        UPSCALE_MODELS[0]
    };

    let mut upscale = json!({ "model": model });
    if options.crop_to_fit {
        upscale["cropToFit"] = json!(true);
    }
    let mut chain = vec![upscale];

    if let Some(interpolation) = options.frame_interpolation.as_deref() {
        if INTERPOLATION_MODELS.contains(&interpolation) {
            chain.push(json!({
                "model": interpolation,
                "slowmo": options.slow_motion.max(1),
                "fps": 60,
                "duplicate": false,
            }));
        }
    }
    chain
}

/// JSON body for `POST /video/`.
pub fn video_request_body(source: &MediaInfo, options: &VideoOptions) -> Result<Value> {
    let configured = parse_resolution(&options.resolution).ok_or_else(|| {
        Error::InvalidRequest(format!(
            "resolution must look like 1920x1080, got {}",
            options.resolution
        ))
    })?;
    let (out_width, out_height) = output_resolution(source, configured);

    Ok(json!({
        "source": {
            "resolution": { "width": source.width, "height": source.height },
            "container": source.container,
            "size": source.size,
            "duration": source.duration,
            "frameCount": source.frame_count,
            "frameRate": source.frame_rate,
        },
        "output": {
            "resolution": { "width": out_width, "height": out_height },
            "frameRate": 30,
            "audioTransfer": "None",
            "audioCodec": "AAC",
            "videoEncoder": "H264",
            "videoProfile": "High",
            "dynamicCompressionLevel": "High",
        },
        "filters": filters(options),
    }))
}
