//! Messaging platform payloads consumed by the push-ingest endpoint.
//!
//! Only the fields needed to turn an attachment into a file node are
//! modelled; everything else in the update is ignored by serde.

use serde::Deserialize;

/// An inbound update pushed by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub channel_post: Option<Message>,
}

impl Update {
    /// The message carried by this update, whichever slot it arrived in.
    pub fn into_message(self) -> Option<Message> {
        self.message.or(self.channel_post)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// A chat message that may carry one attachment.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub caption: Option<String>,
    pub document: Option<Document>,
    pub video: Option<Video>,
    pub animation: Option<Video>,
    pub audio: Option<Audio>,
    pub voice: Option<Voice>,
    pub video_note: Option<VideoNote>,
    pub photo: Option<Vec<PhotoSize>>,
}

/// Which attachment slot of a message a file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Document,
    Video,
    Animation,
    Audio,
    Voice,
    VideoNote,
    Photo,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Video => "video",
            Self::Animation => "animation",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::VideoNote => "video_note",
            Self::Photo => "photo",
        }
    }

    /// Extension used when the platform does not supply a file name.
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Document => "bin",
            Self::Video | Self::Animation | Self::VideoNote => "mp4",
            Self::Audio => "mp3",
            Self::Voice => "ogg",
            Self::Photo => "jpg",
        }
    }

    /// Content type assumed when the platform does not supply one.
    pub fn default_mime_type(self) -> Option<&'static str> {
        match self {
            Self::Document => None,
            Self::Video | Self::Animation | Self::VideoNote => Some("video/mp4"),
            Self::Audio => Some("audio/mpeg"),
            Self::Voice => Some("audio/ogg"),
            Self::Photo => Some("image/jpeg"),
        }
    }
}

/// The single file carried by a message, whatever slot it used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

impl Message {
    /// Pick the attachment of this message.
    ///
    /// Slots are checked in a fixed order; for photos the largest rendition
    /// (the last entry) is taken.
    pub fn attachment(&self) -> Option<Attachment> {
        if let Some(doc) = &self.document {
            return Some(Attachment {
                kind: AttachmentKind::Document,
                file_id: doc.file_id.clone(),
                file_name: doc.file_name.clone(),
                mime_type: doc.mime_type.clone(),
                file_size: doc.file_size,
            });
        }
        for (kind, video) in [
            (AttachmentKind::Video, &self.video),
            (AttachmentKind::Animation, &self.animation),
        ] {
            if let Some(video) = video {
                return Some(Attachment {
                    kind,
                    file_id: video.file_id.clone(),
                    file_name: video.file_name.clone(),
                    mime_type: video.mime_type.clone(),
                    file_size: video.file_size,
                });
            }
        }
        if let Some(audio) = &self.audio {
            let file_name = audio.file_name.clone().or_else(|| {
                audio
                    .title
                    .as_ref()
                    .map(|title| format!("{}.{}", title, AttachmentKind::Audio.default_extension()))
            });
            return Some(Attachment {
                kind: AttachmentKind::Audio,
                file_id: audio.file_id.clone(),
                file_name,
                mime_type: audio.mime_type.clone(),
                file_size: audio.file_size,
            });
        }
        if let Some(voice) = &self.voice {
            return Some(Attachment {
                kind: AttachmentKind::Voice,
                file_id: voice.file_id.clone(),
                file_name: None,
                mime_type: voice.mime_type.clone(),
                file_size: voice.file_size,
            });
        }
        if let Some(note) = &self.video_note {
            return Some(Attachment {
                kind: AttachmentKind::VideoNote,
                file_id: note.file_id.clone(),
                file_name: None,
                mime_type: None,
                file_size: note.file_size,
            });
        }
        let photo = self.photo.as_ref()?.last()?;
        Some(Attachment {
            kind: AttachmentKind::Photo,
            file_id: photo.file_id.clone(),
            file_name: None,
            mime_type: None,
            file_size: photo.file_size,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Audio {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub file_name: Option<String>,
    pub title: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoNote {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub file_unique_id: Option<String>,
    pub width: i64,
    pub height: i64,
    pub file_size: Option<i64>,
}

/// Response envelope used by every platform API method.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

/// Result of `getFile`.
#[derive(Debug, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_size: Option<i64>,
    pub file_path: Option<String>,
}
