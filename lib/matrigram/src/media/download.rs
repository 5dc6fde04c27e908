// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Telegram to Matrix media conversion.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use grammers_tl_types as tl;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::bridge::events::{ConvertedMedia, LinkPreview, MediaInfo, PartKind};
use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::{PeerType, PortalKey};
use crate::media::reference::DirectMediaRef;
use crate::store::MessageRecord;

const CHUNK_SIZE: i32 = 512 * 1024;

type Ctr = ctr::Ctr128BE<Aes256>;

/// What a piece of Telegram media converts into.
pub(crate) enum MediaResult {
    Media {
        kind: PartKind,
        media: ConvertedMedia,
    },
    Preview(LinkPreview),
    Text {
        kind: PartKind,
        body: String,
    },
    Location {
        body: String,
        geo_uri: String,
    },
}

struct DocumentTraits {
    kind: PartKind,
    filename: Option<String>,
    info: MediaInfo,
    animated_sticker: bool,
}

fn document_traits(document: &tl::types::Document) -> DocumentTraits {
    let mut traits = DocumentTraits {
        kind: PartKind::File,
        filename: None,
        info: MediaInfo::default(),
        animated_sticker: false,
    };
    for attribute in &document.attributes {
        use tl::enums::DocumentAttribute as DA;
        match attribute {
            DA::Filename(a) => traits.filename = Some(a.file_name.clone()),
            DA::ImageSize(a) => {
                if traits.kind == PartKind::File {
                    traits.kind = PartKind::Image;
                }
                traits.info.width = Some(a.w);
                traits.info.height = Some(a.h);
            }
            DA::Video(a) => {
                traits.kind = PartKind::Video;
                traits.info.width = Some(a.w);
                traits.info.height = Some(a.h);
                traits.info.duration = Some(a.duration);
            }
            DA::Audio(a) => {
                traits.kind = if a.voice { PartKind::Voice } else { PartKind::Audio };
                traits.info.duration = Some(a.duration as f64);
            }
            DA::Sticker(_) => traits.kind = PartKind::Sticker,
            DA::CustomEmoji(_) => traits.kind = PartKind::Sticker,
            DA::Animated => {}
            _ => {}
        }
    }
    traits.animated_sticker = traits.kind == PartKind::Sticker
        && matches!(
            document.mime_type.as_str(),
            "application/x-tgsticker" | "video/webm"
        );
    traits
}

/// Picks the largest regular size of a photo, returning its type string
/// and byte size.
fn best_photo_size(photo: &tl::types::Photo) -> Option<(String, i64, MediaInfo)> {
    let mut best: Option<(String, i64, MediaInfo)> = None;
    for size in &photo.sizes {
        let candidate = match size {
            tl::enums::PhotoSize::Size(s) => Some((
                s.r#type.clone(),
                s.size as i64,
                MediaInfo {
                    width: Some(s.w),
                    height: Some(s.h),
                    duration: None,
                },
            )),
            tl::enums::PhotoSize::Progressive(s) => Some((
                s.r#type.clone(),
                s.sizes.last().copied().unwrap_or(0) as i64,
                MediaInfo {
                    width: Some(s.w),
                    height: Some(s.h),
                    duration: None,
                },
            )),
            _ => None,
        };
        if let Some(candidate) = candidate {
            let better = best
                .as_ref()
                .map(|(_, size, _)| candidate.1 > *size)
                .unwrap_or(true);
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

impl SessionClient {
    /// Converts message media, retrying once with fresh file references
    /// when the stored ones expired.
    pub(crate) async fn convert_media(
        &self,
        media: &tl::enums::MessageMedia,
        portal: PortalKey,
        msg_id: i32,
        reuse: Option<&MessageRecord>,
    ) -> Result<Option<MediaResult>, BridgeError> {
        match self.convert_media_inner(media, portal, msg_id, reuse).await {
            Err(e) if e.is("FILE_REFERENCE_*") => {
                debug!("file reference expired for {portal}/{msg_id}, refetching");
                let fresh = self.refetch_message(portal, msg_id).await?;
                match fresh.and_then(|m| m.media) {
                    Some(media) => {
                        self.convert_media_inner(&media, portal, msg_id, reuse).await
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn convert_media_inner(
        &self,
        media: &tl::enums::MessageMedia,
        portal: PortalKey,
        msg_id: i32,
        reuse: Option<&MessageRecord>,
    ) -> Result<Option<MediaResult>, BridgeError> {
        use tl::enums::MessageMedia as MM;
        match media {
            MM::Photo(m) => {
                let photo = match &m.photo {
                    Some(tl::enums::Photo::Photo(photo)) => photo,
                    _ => return Ok(None),
                };
                self.convert_photo(photo, portal, msg_id, reuse)
                    .await
                    .map(Some)
            }
            MM::Document(m) => {
                let document = match &m.document {
                    Some(tl::enums::Document::Document(document)) => document,
                    _ => return Ok(None),
                };
                self.convert_document(document, portal, msg_id, reuse)
                    .await
                    .map(Some)
            }
            MM::WebPage(m) => match &m.webpage {
                tl::enums::WebPage::Page(page) => {
                    let image = match &page.photo {
                        Some(tl::enums::Photo::Photo(photo)) => self
                            .convert_photo(photo, portal, msg_id, None)
                            .await
                            .ok()
                            .and_then(|result| match result {
                                MediaResult::Media { media, .. } => Some(media),
                                _ => None,
                            }),
                        _ => None,
                    };
                    Ok(Some(MediaResult::Preview(LinkPreview {
                        url: page.url.clone(),
                        title: page.title.clone(),
                        description: page.description.clone(),
                        site_name: page.site_name.clone(),
                        image,
                    })))
                }
                _ => Ok(None),
            },
            MM::Geo(m) => Ok(geo_uri(&m.geo).map(|uri| MediaResult::Location {
                body: "Location".to_string(),
                geo_uri: uri,
            })),
            MM::GeoLive(m) => Ok(geo_uri(&m.geo).map(|uri| MediaResult::Location {
                body: "Live location".to_string(),
                geo_uri: uri,
            })),
            MM::Venue(m) => Ok(geo_uri(&m.geo).map(|uri| MediaResult::Location {
                body: format!("{} ({})", m.title, m.address),
                geo_uri: uri,
            })),
            MM::Contact(m) => {
                let mut name = m.first_name.clone();
                if !m.last_name.is_empty() {
                    name.push(' ');
                    name.push_str(&m.last_name);
                }
                Ok(Some(MediaResult::Text {
                    kind: PartKind::Text,
                    body: format!("Shared contact: {name} ({})", m.phone_number),
                }))
            }
            MM::Poll(m) => {
                let poll: tl::types::Poll = m.poll.clone().into();
                let question: tl::types::TextWithEntities = poll.question.into();
                let mut body = format!("Poll: {}", question.text);
                for answer in poll.answers {
                    let answer: tl::types::PollAnswer = answer.into();
                    let text: tl::types::TextWithEntities = answer.text.into();
                    body.push_str("\n- ");
                    body.push_str(&text.text);
                }
                body.push_str("\n(Open Telegram to vote)");
                Ok(Some(MediaResult::Text {
                    kind: PartKind::Notice,
                    body,
                }))
            }
            MM::Dice(m) => Ok(Some(MediaResult::Text {
                kind: PartKind::Text,
                body: format!("{} rolled {}", m.emoticon, m.value),
            })),
            MM::Unsupported => Ok(Some(MediaResult::Text {
                kind: PartKind::Notice,
                body: "This message is not supported by your version of the bridge".to_string(),
            })),
            MM::Empty => Ok(None),
            other => {
                debug!("unhandled media kind {:?} in {portal}/{msg_id}", media_name(other));
                Ok(Some(MediaResult::Text {
                    kind: PartKind::Notice,
                    body: "Unsupported media".to_string(),
                }))
            }
        }
    }

    async fn convert_photo(
        &self,
        photo: &tl::types::Photo,
        portal: PortalKey,
        msg_id: i32,
        reuse: Option<&MessageRecord>,
    ) -> Result<MediaResult, BridgeError> {
        let (thumb_type, size, info) = best_photo_size(photo)
            .ok_or(BridgeError::UnexpectedResponse("photo without sizes"))?;

        if let Some(record) = reuse {
            if record.media_id == Some(photo.id) {
                if let Some(mxc) = &record.content_uri {
                    return Ok(MediaResult::Media {
                        kind: PartKind::Image,
                        media: ConvertedMedia::Uploaded {
                            mxc: mxc.clone(),
                            mime: "image/jpeg".to_string(),
                            filename: None,
                            size: Some(size),
                            info,
                        },
                    });
                }
            }
        }

        if self.config().direct_media {
            return Ok(MediaResult::Media {
                kind: PartKind::Image,
                media: ConvertedMedia::Direct {
                    reference: self.media_reference(portal, msg_id, photo.id),
                    mime: Some("image/jpeg".to_string()),
                    filename: None,
                    size: Some(size),
                    info,
                },
            });
        }

        let location =
            tl::enums::InputFileLocation::InputPhotoFileLocation(tl::types::InputPhotoFileLocation {
                id: photo.id,
                access_hash: photo.access_hash,
                file_reference: photo.file_reference.clone(),
                thumb_size: thumb_type,
            });
        let bytes = self.download_file(location).await?;
        let mxc = self
            .0
            .media
            .upload(bytes, "image/jpeg", None)
            .await
            .map_err(|e| BridgeError::Media(e.to_string()))?;
        Ok(MediaResult::Media {
            kind: PartKind::Image,
            media: ConvertedMedia::Uploaded {
                mxc,
                mime: "image/jpeg".to_string(),
                filename: None,
                size: Some(size),
                info,
            },
        })
    }

    async fn convert_document(
        &self,
        document: &tl::types::Document,
        portal: PortalKey,
        msg_id: i32,
        reuse: Option<&MessageRecord>,
    ) -> Result<MediaResult, BridgeError> {
        let traits = document_traits(document);

        if let Some(record) = reuse {
            if record.media_id == Some(document.id) {
                if let Some(mxc) = &record.content_uri {
                    return Ok(MediaResult::Media {
                        kind: traits.kind,
                        media: ConvertedMedia::Uploaded {
                            mxc: mxc.clone(),
                            mime: document.mime_type.clone(),
                            filename: traits.filename,
                            size: Some(document.size),
                            info: traits.info,
                        },
                    });
                }
            }
        }

        // Converted stickers differ from the bytes Telegram serves, so
        // they can never be addressed directly.
        let convert_sticker =
            traits.animated_sticker && self.config().animated_sticker_conversion;
        if self.config().direct_media && !convert_sticker {
            return Ok(MediaResult::Media {
                kind: traits.kind,
                media: ConvertedMedia::Direct {
                    reference: self.media_reference(portal, msg_id, document.id),
                    mime: Some(document.mime_type.clone()),
                    filename: traits.filename,
                    size: Some(document.size),
                    info: traits.info,
                },
            });
        }

        let location = tl::enums::InputFileLocation::InputDocumentFileLocation(
            tl::types::InputDocumentFileLocation {
                id: document.id,
                access_hash: document.access_hash,
                file_reference: document.file_reference.clone(),
                thumb_size: String::new(),
            },
        );
        let bytes = self.download_file(location).await?;

        let (bytes, mime) = if convert_sticker && document.mime_type == "video/webm" {
            match super::upload::ffmpeg_convert(&bytes, "webm", "webp").await {
                Ok(converted) => (converted, "image/webp".to_string()),
                Err(e) => {
                    warn!("sticker conversion failed, bridging raw: {e}");
                    (bytes, document.mime_type.clone())
                }
            }
        } else {
            (bytes, document.mime_type.clone())
        };

        let size = Some(bytes.len() as i64);
        let mxc = self
            .0
            .media
            .upload(bytes, &mime, traits.filename.as_deref())
            .await
            .map_err(|e| BridgeError::Media(e.to_string()))?;
        Ok(MediaResult::Media {
            kind: traits.kind,
            media: ConvertedMedia::Uploaded {
                mxc,
                mime,
                filename: traits.filename,
                size,
                info: traits.info,
            },
        })
    }

    fn media_reference(&self, portal: PortalKey, msg_id: i32, media_id: i64) -> DirectMediaRef {
        DirectMediaRef {
            peer_type: portal.peer_type,
            peer_id: portal.id,
            login_user_id: self.user_id(),
            message_id: msg_id as i64,
            media_id,
            thumbnail: false,
        }
    }

    /// Fetches the message that owns some media, learning entities on
    /// the way. Used for fresh file references and direct serving.
    pub(crate) async fn refetch_message(
        &self,
        portal: PortalKey,
        msg_id: i32,
    ) -> Result<Option<tl::types::Message>, BridgeError> {
        let id = vec![tl::enums::InputMessage::Id(tl::types::InputMessageId {
            id: msg_id,
        })];
        let client = self.raw()?;
        let response = if portal.peer_type == PeerType::Channel {
            client
                .invoke(&tl::functions::channels::GetMessages {
                    channel: self.input_channel(portal)?,
                    id,
                })
                .await?
        } else {
            client
                .invoke(&tl::functions::messages::GetMessages { id })
                .await?
        };

        use tl::enums::messages::Messages;
        let (messages, users, chats) = match response {
            Messages::Messages(m) => (m.messages, m.users, m.chats),
            Messages::Slice(m) => (m.messages, m.users, m.chats),
            Messages::ChannelMessages(m) => (m.messages, m.users, m.chats),
            Messages::NotModified(_) => {
                return Err(BridgeError::UnexpectedResponse(
                    "messagesNotModified for getMessages",
                ));
            }
        };
        self.absorb_entities(&users, &chats);
        Ok(messages.into_iter().find_map(|m| match m {
            tl::enums::Message::Message(m) if m.id == msg_id => Some(m),
            _ => None,
        }))
    }

    /// Downloads a file into memory, following CDN redirects.
    pub(crate) async fn download_file(
        &self,
        location: tl::enums::InputFileLocation,
    ) -> Result<Vec<u8>, BridgeError> {
        let (tx, mut rx) = mpsc::channel(16);
        let fetch = self.fetch_file_chunks(location, tx);
        let drain = async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(chunk) => out.extend_from_slice(&chunk),
                    Err(e) => return Err(BridgeError::Media(e.to_string())),
                }
            }
            Ok(out)
        };
        let ((), bytes) = tokio::join!(fetch, drain);
        bytes
    }

    /// Pulls file chunks into a channel; errors are delivered in-band.
    async fn fetch_file_chunks(
        &self,
        location: tl::enums::InputFileLocation,
        tx: mpsc::Sender<io::Result<Vec<u8>>>,
    ) {
        let client = match self.raw() {
            Ok(client) => client,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
        };

        let mut offset: i64 = 0;
        loop {
            let request = tl::functions::upload::GetFile {
                precise: false,
                cdn_supported: true,
                location: location.clone(),
                offset,
                limit: CHUNK_SIZE,
            };
            match client.invoke(&request).await {
                Ok(tl::enums::upload::File::File(file)) => {
                    let len = file.bytes.len();
                    if len > 0 && tx.send(Ok(file.bytes)).await.is_err() {
                        return;
                    }
                    if len < CHUNK_SIZE as usize {
                        return;
                    }
                    offset += len as i64;
                }
                Ok(tl::enums::upload::File::CdnRedirect(redirect)) => {
                    self.fetch_cdn_chunks(&client, redirect, offset, tx).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }
    }

    /// Serves chunks from a CDN datacenter, decrypting each with
    /// AES-256-CTR keyed by the redirect parameters.
    async fn fetch_cdn_chunks(
        &self,
        client: &grammers_client::Client,
        redirect: tl::types::upload::FileCdnRedirect,
        mut offset: i64,
        tx: mpsc::Sender<io::Result<Vec<u8>>>,
    ) {
        let key: [u8; 32] = match redirect.encryption_key.as_slice().try_into() {
            Ok(key) => key,
            Err(_) => {
                let _ = tx
                    .send(Err(io::Error::other("bad CDN encryption key")))
                    .await;
                return;
            }
        };

        loop {
            let request = tl::functions::upload::GetCdnFile {
                file_token: redirect.file_token.clone(),
                offset,
                limit: CHUNK_SIZE,
            };
            match client.invoke_in_dc(redirect.dc_id, &request).await {
                Ok(tl::enums::upload::CdnFile::File(file)) => {
                    let mut bytes = file.bytes;
                    let len = bytes.len();
                    if len > 0 {
                        // The IV's last word counts 16-byte blocks.
                        let mut iv = [0u8; 16];
                        iv[..12].copy_from_slice(&redirect.encryption_iv[..12]);
                        iv[12..].copy_from_slice(&((offset / 16) as u32).to_be_bytes());
                        Ctr::new(&key.into(), &iv.into()).apply_keystream(&mut bytes);
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    if len < CHUNK_SIZE as usize {
                        return;
                    }
                    offset += len as i64;
                }
                Ok(tl::enums::upload::CdnFile::ReuploadNeeded(needed)) => {
                    let reupload = tl::functions::upload::ReuploadCdnFile {
                        file_token: redirect.file_token.clone(),
                        request_token: needed.request_token.clone(),
                    };
                    if let Err(e) = client.invoke(&reupload).await {
                        let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }
    }

    /// Performs the fetch behind a direct-media reference, returning a
    /// streaming body. The caller has already picked a login that sits
    /// in the reference's portal.
    pub async fn serve_direct_media(
        &self,
        reference: DirectMediaRef,
    ) -> Result<DirectDownload, BridgeError> {
        self.wait_ready().await?;

        let portal = PortalKey {
            peer_type: reference.peer_type,
            id: reference.peer_id,
            receiver: None,
        };

        let (location, mime, size) = if reference.message_id == 0 {
            // Avatar and profile-photo references.
            let location = tl::enums::InputFileLocation::InputPeerPhotoFileLocation(
                tl::types::InputPeerPhotoFileLocation {
                    big: !reference.thumbnail,
                    peer: self.input_peer(portal)?,
                    photo_id: reference.media_id,
                },
            );
            (location, "image/jpeg".to_string(), None)
        } else {
            let message = self
                .refetch_message(portal, reference.message_id as i32)
                .await?
                .ok_or(BridgeError::UnknownMessage(portal, reference.message_id as i32))?;
            match message.media {
                Some(tl::enums::MessageMedia::Photo(m)) => match m.photo {
                    Some(tl::enums::Photo::Photo(photo)) if photo.id == reference.media_id => {
                        let (thumb_type, size, _) = best_photo_size(&photo)
                            .ok_or(BridgeError::UnexpectedResponse("photo without sizes"))?;
                        (
                            tl::enums::InputFileLocation::InputPhotoFileLocation(
                                tl::types::InputPhotoFileLocation {
                                    id: photo.id,
                                    access_hash: photo.access_hash,
                                    file_reference: photo.file_reference,
                                    thumb_size: thumb_type,
                                },
                            ),
                            "image/jpeg".to_string(),
                            Some(size),
                        )
                    }
                    _ => {
                        return Err(BridgeError::UnexpectedResponse(
                            "message photo does not match reference",
                        ));
                    }
                },
                Some(tl::enums::MessageMedia::Document(m)) => match m.document {
                    Some(tl::enums::Document::Document(document))
                        if document.id == reference.media_id =>
                    {
                        (
                            tl::enums::InputFileLocation::InputDocumentFileLocation(
                                tl::types::InputDocumentFileLocation {
                                    id: document.id,
                                    access_hash: document.access_hash,
                                    file_reference: document.file_reference,
                                    thumb_size: String::new(),
                                },
                            ),
                            document.mime_type,
                            Some(document.size),
                        )
                    }
                    _ => {
                        return Err(BridgeError::UnexpectedResponse(
                            "message document does not match reference",
                        ));
                    }
                },
                _ => {
                    return Err(BridgeError::UnexpectedResponse(
                        "referenced message has no media",
                    ));
                }
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        tokio::spawn(async move { this.fetch_file_chunks(location, tx).await });

        Ok(DirectDownload {
            mime,
            size,
            stream: MediaStream {
                rx,
                pending: Vec::new(),
                pos: 0,
            },
        })
    }
}

/// A direct-media response: content type plus a streaming body.
pub struct DirectDownload {
    pub mime: String,
    pub size: Option<i64>,
    pub stream: MediaStream,
}

/// Streams downloaded chunks as an [`tokio::io::AsyncRead`].
pub struct MediaStream {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
}

impl tokio::io::AsyncRead for MediaStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = (this.pending.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending = chunk;
                    this.pos = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn geo_uri(geo: &tl::enums::GeoPoint) -> Option<String> {
    match geo {
        tl::enums::GeoPoint::Point(point) => Some(format!("geo:{},{}", point.lat, point.long)),
        tl::enums::GeoPoint::Empty => None,
    }
}

fn media_name(media: &tl::enums::MessageMedia) -> &'static str {
    use tl::enums::MessageMedia as MM;
    match media {
        MM::Game(_) => "game",
        MM::Invoice(_) => "invoice",
        MM::Story(_) => "story",
        MM::Giveaway(_) => "giveaway",
        MM::GiveawayResults(_) => "giveawayResults",
        MM::PaidMedia(_) => "paidMedia",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn media_stream_reassembles_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = MediaStream {
            rx,
            pending: Vec::new(),
            pos: 0,
        };
        tx.send(Ok(vec![1, 2, 3])).await.unwrap();
        tx.send(Ok(vec![4, 5])).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn media_stream_surfaces_errors() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = MediaStream {
            rx,
            pending: Vec::new(),
            pos: 0,
        };
        tx.send(Err(io::Error::other("boom"))).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).await.is_err());
    }
}
