//! Conversion between chat text and the server's HTML subset.

use std::io::Cursor;

use backend_core::{
    Attachment, BackendError, BackendErrorCategory, escape_html, plain_text_from_html,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::{debug, warn};

/// Longest edge of an inline image preview, in pixels.
pub const PREVIEW_MAX_DIMENSION: u32 = 400;

/// An attachment ready for rendering, with its inline preview if one fits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedAttachment {
    pub name: String,
    pub uri: String,
    /// `data:` URI of the downscaled image.
    pub preview: Option<String>,
}

/// Escape plain text and keep its line breaks.
pub fn render_text(body: &str) -> String {
    escape_html(body).replace("\r\n", "\n").replace('\n', "<br>")
}

/// Render a message body followed by its attachments: every attachment is
/// linked, and image previews are embedded below the link.
pub fn render_outgoing(body: &str, attachments: &[RenderedAttachment]) -> String {
    let mut html = render_text(body);
    for attachment in attachments {
        if !html.is_empty() {
            html.push_str("<br>");
        }
        let uri = escape_html(&attachment.uri);
        html.push_str(&format!("<a href=\"{uri}\">{uri}</a>"));
        if let Some(preview) = &attachment.preview {
            html.push_str(&format!("<br><img src=\"{preview}\"/>"));
        }
    }
    html
}

/// Split an inbound HTML message into plain text and inline images.
pub fn parse_incoming(html: &str) -> (String, Vec<Attachment>) {
    let mut attachments = Vec::new();
    let mut rest = html;
    while let Some(start) = find_ignore_case(rest, "<img") {
        let tag_end = rest[start..].find('>').map_or(rest.len(), |end| start + end);
        let tag = &rest[start..tag_end];
        if let Some(src) = attribute(tag, "src") {
            let name = attribute(tag, "alt")
                .filter(|alt| !alt.is_empty())
                .unwrap_or_else(|| format!("image-{}", attachments.len() + 1));
            attachments.push(Attachment::image(name, src));
        }
        rest = &rest[tag_end..];
    }
    (plain_text_from_html(html), attachments)
}

/// Downscale an encoded image and return it as a JPEG `data:` URI.
pub fn render_preview(bytes: &[u8]) -> Result<String, BackendError> {
    let image = image::load_from_memory(bytes).map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Serialization,
            "image_decode_failed",
            err.to_string(),
        )
    })?;

    let (width, height) = image.dimensions();
    let image = if width > PREVIEW_MAX_DIMENSION || height > PREVIEW_MAX_DIMENSION {
        image.thumbnail(PREVIEW_MAX_DIMENSION, PREVIEW_MAX_DIMENSION)
    } else {
        image
    };

    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut encoded, ImageFormat::Jpeg)
        .map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Serialization,
                "image_encode_failed",
                err.to_string(),
            )
        })?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        STANDARD.encode(encoded.into_inner())
    ))
}

/// Fetch an image attachment and build its inline preview.
///
/// Failures only cost the preview; the attachment is still linked.
pub async fn fetch_preview(
    http: &reqwest::Client,
    uri: &str,
    max_len: Option<u32>,
) -> Option<String> {
    let preview = match download(http, uri).await.and_then(|bytes| render_preview(&bytes)) {
        Ok(preview) => preview,
        Err(err) => {
            warn!(uri, error = %err, "failed to build image preview");
            return None;
        }
    };

    match max_len {
        Some(max_len) if preview.len() > max_len as usize => {
            debug!(uri, len = preview.len(), max_len, "image preview exceeds server limit");
            None
        }
        _ => Some(preview),
    }
}

async fn download(http: &reqwest::Client, uri: &str) -> Result<Vec<u8>, BackendError> {
    if let Some(data) = uri.strip_prefix("data:") {
        let encoded = data
            .split_once(";base64,")
            .map(|(_, encoded)| encoded)
            .ok_or_else(|| {
                BackendError::new(
                    BackendErrorCategory::Serialization,
                    "unsupported_data_uri",
                    "only base64 data URIs are supported",
                )
            })?;
        return STANDARD.decode(encoded).map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Serialization,
                "invalid_data_uri",
                err.to_string(),
            )
        });
    }

    let response = http
        .get(uri)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| BackendError::network("image_fetch_failed", err.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|err| BackendError::network("image_fetch_failed", err.to_string()))?;
    Ok(bytes.to_vec())
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .char_indices()
        .map(|(index, _)| index)
        .find(|index| {
            haystack
                .get(*index..*index + needle.len())
                .is_some_and(|window| window.eq_ignore_ascii_case(needle))
        })
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let mut rest = tag;
    while let Some(found) = find_ignore_case(rest, name) {
        let after = rest[found + name.len()..].trim_start();
        let preceded_by_space = rest[..found]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace);
        if preceded_by_space && let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let quote = value.chars().next()?;
            let value = if quote == '"' || quote == '\'' {
                let inner = &value[1..];
                &inner[..inner.find(quote)?]
            } else {
                value.split_whitespace().next().unwrap_or_default()
            };
            return Some(value.replace("&amp;", "&"));
        }
        rest = &rest[found + name.len()..];
    }
    None
}
