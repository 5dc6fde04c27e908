// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Matrix to Telegram media upload.

use grammers_tl_types as tl;
use log::debug;

use super::waveform;
use crate::bridge::events::PartKind;
use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::util::generate_random_id;

/// Part size for chunked uploads.
const UPLOAD_PART_SIZE: usize = 512 * 1024;
/// Above this, Telegram requires the "big file" upload scheme.
const BIG_FILE_THRESHOLD: usize = 10 * 1024 * 1024;
/// Hard limits Telegram applies to photo uploads; anything beyond goes
/// out as a document to dodge server-side re-encoding failures.
const PHOTO_MAX_BYTES: usize = 10 * 1024 * 1024;
const PHOTO_MAX_RATIO: i64 = 20;
const PHOTO_MAX_DIMENSION_SUM: i64 = 10_000;

/// One Matrix file to push to Telegram, already fetched from the media
/// repository by the caller.
pub struct UploadRequest {
    pub kind: PartKind,
    pub mime: String,
    pub filename: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<f64>,
    /// Raw amplitude samples for voice messages.
    pub waveform: Vec<u32>,
}

impl SessionClient {
    /// Uploads raw bytes in parts and returns the resulting input file.
    pub(crate) async fn upload_file(
        &self,
        data: &[u8],
        name: &str,
    ) -> Result<tl::enums::InputFile, BridgeError> {
        let client = self.raw()?;
        let file_id = generate_random_id();
        let total_parts = data.len().div_ceil(UPLOAD_PART_SIZE).max(1) as i32;
        let big = data.len() > BIG_FILE_THRESHOLD;

        for (index, part) in data.chunks(UPLOAD_PART_SIZE.max(1)).enumerate() {
            let saved = if big {
                client
                    .invoke(&tl::functions::upload::SaveBigFilePart {
                        file_id,
                        file_part: index as i32,
                        file_total_parts: total_parts,
                        bytes: part.to_vec(),
                    })
                    .await?
            } else {
                client
                    .invoke(&tl::functions::upload::SaveFilePart {
                        file_id,
                        file_part: index as i32,
                        bytes: part.to_vec(),
                    })
                    .await?
            };
            if !saved {
                return Err(BridgeError::Media(format!(
                    "server refused file part {index}"
                )));
            }
        }

        Ok(if big {
            tl::enums::InputFile::Big(tl::types::InputFileBig {
                id: file_id,
                parts: total_parts,
                name: name.to_string(),
            })
        } else {
            tl::enums::InputFile::File(tl::types::InputFile {
                id: file_id,
                parts: total_parts,
                name: name.to_string(),
                md5_checksum: format!("{:x}", md5::compute(data)),
            })
        })
    }

    /// Classifies and uploads one Matrix file, producing the media to
    /// attach to the outgoing message.
    pub(crate) async fn prepare_upload(
        &self,
        request: &UploadRequest,
        data: Vec<u8>,
    ) -> Result<tl::enums::InputMedia, BridgeError> {
        let mut data = data;
        let mut mime = request.mime.clone();

        if request.kind == PartKind::Sticker {
            // Telegram only accepts WEBP (or WEBM/TGS) stickers.
            match mime.as_str() {
                "image/webp" | "video/webm" | "application/x-tgsticker" => {}
                "image/jpeg" | "image/png" => {
                    data = ffmpeg_convert(&data, ext_for_mime(&mime), "webp").await?;
                    mime = "image/webp".to_string();
                }
                _ => {
                    data = ffmpeg_convert(&data, ext_for_mime(&mime), "webp").await?;
                    mime = "image/webp".to_string();
                }
            }
        }

        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| default_filename(&mime));
        let file = self.upload_file(&data, &filename).await?;

        if request.kind != PartKind::Sticker && photo_friendly(request, &mime, data.len()) {
            let area = request.width.unwrap_or(0) as i64 * request.height.unwrap_or(0) as i64;
            if area <= self.config().photo_max_area {
                return Ok(tl::enums::InputMedia::UploadedPhoto(
                    tl::types::InputMediaUploadedPhoto {
                        spoiler: false,
                        file,
                        stickers: None,
                        ttl_seconds: None,
                    },
                ));
            }
        }

        let mut attributes = vec![tl::enums::DocumentAttribute::Filename(
            tl::types::DocumentAttributeFilename {
                file_name: filename,
            },
        )];
        match request.kind {
            PartKind::Image | PartKind::Sticker => {
                if let (Some(w), Some(h)) = (request.width, request.height) {
                    attributes.push(tl::enums::DocumentAttribute::ImageSize(
                        tl::types::DocumentAttributeImageSize { w, h },
                    ));
                }
                if request.kind == PartKind::Sticker {
                    attributes.push(tl::enums::DocumentAttribute::Sticker(
                        tl::types::DocumentAttributeSticker {
                            mask: false,
                            alt: String::new(),
                            stickerset: tl::enums::InputStickerSet::Empty,
                            mask_coords: None,
                        },
                    ));
                }
                if mime == "image/gif" {
                    attributes.push(tl::enums::DocumentAttribute::Animated);
                }
            }
            PartKind::Video => {
                attributes.push(tl::enums::DocumentAttribute::Video(
                    tl::types::DocumentAttributeVideo {
                        round_message: false,
                        supports_streaming: true,
                        nosound: false,
                        duration: request.duration.unwrap_or(0.0),
                        w: request.width.unwrap_or(0),
                        h: request.height.unwrap_or(0),
                        preload_prefix_size: None,
                        video_start_ts: None,
                        video_codec: None,
                    },
                ));
            }
            PartKind::Audio | PartKind::Voice => {
                let voice = request.kind == PartKind::Voice;
                attributes.push(tl::enums::DocumentAttribute::Audio(
                    tl::types::DocumentAttributeAudio {
                        voice,
                        duration: request.duration.unwrap_or(0.0) as i32,
                        title: None,
                        performer: None,
                        waveform: if voice && !request.waveform.is_empty() {
                            Some(waveform::encode(&waveform::normalize(&request.waveform)))
                        } else {
                            None
                        },
                    },
                ));
            }
            _ => {}
        }

        Ok(tl::enums::InputMedia::UploadedDocument(
            tl::types::InputMediaUploadedDocument {
                nosound_video: false,
                force_file: false,
                spoiler: false,
                file,
                thumb: None,
                mime_type: mime,
                attributes,
                stickers: None,
                video_cover: None,
                video_timestamp: None,
                ttl_seconds: None,
            },
        ))
    }
}

fn photo_friendly(request: &UploadRequest, mime: &str, len: usize) -> bool {
    if !matches!(mime, "image/jpeg" | "image/png") || len > PHOTO_MAX_BYTES {
        return false;
    }
    match (request.width, request.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {
            let (w, h) = (w as i64, h as i64);
            let ratio = w.max(h) / w.min(h).max(1);
            ratio <= PHOTO_MAX_RATIO && w + h <= PHOTO_MAX_DIMENSION_SUM
        }
        // Without dimensions, trust the mime type.
        _ => true,
    }
}

fn ext_for_mime(mime: &str) -> &str {
    mime_guess::get_mime_extensions_str(mime)
        .and_then(|exts| exts.first())
        .copied()
        .unwrap_or("bin")
}

fn default_filename(mime: &str) -> String {
    format!("file.{}", ext_for_mime(mime))
}

/// Transcodes a blob by round-tripping it through ffmpeg on disk.
pub(crate) async fn ffmpeg_convert(
    data: &[u8],
    from_ext: &str,
    to_ext: &str,
) -> Result<Vec<u8>, BridgeError> {
    let dir = std::env::temp_dir();
    let nonce = generate_random_id().unsigned_abs();
    let input = dir.join(format!("matrigram-{nonce}.{from_ext}"));
    let output = dir.join(format!("matrigram-{nonce}-out.{to_ext}"));

    let result = async {
        tokio::fs::write(&input, data)
            .await
            .map_err(|e| BridgeError::Media(format!("temp write failed: {e}")))?;
        let status = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(&input)
            .arg(&output)
            .output()
            .await
            .map_err(|e| BridgeError::Media(format!("failed to run ffmpeg: {e}")))?;
        if !status.status.success() {
            return Err(BridgeError::Media(format!(
                "ffmpeg exited with {}",
                status.status
            )));
        }
        tokio::fs::read(&output)
            .await
            .map_err(|e| BridgeError::Media(format!("temp read failed: {e}")))
    }
    .await;

    if tokio::fs::remove_file(&input).await.is_err() {
        debug!("leaked temp file {}", input.display());
    }
    if tokio::fs::remove_file(&output).await.is_err() && result.is_ok() {
        debug!("leaked temp file {}", output.display());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: PartKind, mime: &str, w: i32, h: i32) -> UploadRequest {
        UploadRequest {
            kind,
            mime: mime.to_string(),
            filename: None,
            width: Some(w),
            height: Some(h),
            duration: None,
            waveform: Vec::new(),
        }
    }

    #[test]
    fn photo_classification() {
        assert!(photo_friendly(
            &request(PartKind::Image, "image/jpeg", 1280, 720),
            "image/jpeg",
            100_000,
        ));
        // Excessive aspect ratio.
        assert!(!photo_friendly(
            &request(PartKind::Image, "image/png", 8000, 100),
            "image/png",
            100_000,
        ));
        // Too large on disk.
        assert!(!photo_friendly(
            &request(PartKind::Image, "image/jpeg", 100, 100),
            "image/jpeg",
            20 * 1024 * 1024,
        ));
        // Combined dimensions beyond the server limit.
        assert!(!photo_friendly(
            &request(PartKind::Image, "image/jpeg", 6000, 5000),
            "image/jpeg",
            100_000,
        ));
        // Not an image format Telegram accepts as a photo.
        assert!(!photo_friendly(
            &request(PartKind::Image, "image/tiff", 100, 100),
            "image/tiff",
            1000,
        ));
    }

    #[test]
    fn filenames() {
        assert_eq!(default_filename("application/pdf"), "file.pdf");
        assert!(default_filename("application/x-nonexistent-mime").ends_with(".bin"));
    }
}
