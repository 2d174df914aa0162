//! Media assets and their renderer classification.

use serde::{Deserialize, Serialize};

/// Hosts whose video URLs are played through an embedded remote player instead of
/// being downloaded.
const EMBED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtu.be",
    "vimeo.com",
    "player.vimeo.com",
];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "m4v", "mkv"];

/// A remotely authored media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "file_url", alias = "fileUrl")]
    pub url: String,
    #[serde(alias = "mime_type", default)]
    pub mime_type: String,
    /// Declared size in bytes, as reported by the backend.
    #[serde(alias = "file_size", default)]
    pub file_size: Option<u64>,
    /// Intrinsic duration in seconds (videos).
    #[serde(default)]
    pub duration: Option<f64>,
}

impl MediaAsset {
    pub fn kind(&self) -> MediaKind {
        MediaKind::detect(&self.mime_type, &self.url)
    }

    /// Whether the asset is played from a local cached file (and therefore needs
    /// downloading).
    pub fn needs_download(&self) -> bool {
        self.kind().is_local()
    }

    /// File extension used for the cached copy.
    pub fn file_extension(&self) -> String {
        if let Some(ext) = extension_from_mime(&self.mime_type) {
            return ext.to_string();
        }
        url_extension(&self.url).unwrap_or_else(|| "bin".to_string())
    }
}

/// Renderer classification of a media asset, resolved once per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image rendered from the local cache.
    Image,
    /// Video file rendered from the local cache.
    LocalVideo,
    /// Video hosted by a remote player (not cached).
    RemoteEmbed,
    /// Not playable on this terminal.
    Unsupported,
}

impl MediaKind {
    pub fn detect(mime_type: &str, url: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

        if let Some(host) = host.as_deref()
            && EMBED_HOSTS.contains(&host)
        {
            return MediaKind::RemoteEmbed;
        }

        if mime.starts_with("image/") {
            return MediaKind::Image;
        }
        if mime.starts_with("video/") {
            return MediaKind::LocalVideo;
        }
        if !mime.is_empty() && mime != "application/octet-stream" {
            return MediaKind::Unsupported;
        }

        // No usable MIME type: fall back to the URL extension.
        match url_extension(url).as_deref() {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => MediaKind::Image,
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext) => MediaKind::LocalVideo,
            _ => MediaKind::Unsupported,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::LocalVideo)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, MediaKind::Unsupported)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::LocalVideo => "local_video",
            MediaKind::RemoteEmbed => "remote_embed",
            MediaKind::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn extension_from_mime(mime_type: &str) -> Option<&'static str> {
    let ext = match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        _ => return None,
    };
    Some(ext)
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}
