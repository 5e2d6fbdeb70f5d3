use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use std::path::Path;

/// The few tags ingestion cares about.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<f64>,
}

impl TagInfo {
    /// "Artist - Title" when both are tagged, the title alone otherwise.
    pub fn display_title(&self) -> Option<String> {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => Some(format!("{artist} - {title}")),
            (None, Some(title)) => Some(title.clone()),
            _ => None,
        }
    }
}

/// Read tags from an audio file. Returns empty tags on failure (e.g., raw PCM).
pub fn read_tags(path: &Path) -> TagInfo {
    let tagged_file = match lofty::read_from_path(path) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("Could not read tags from {}: {}", path.display(), e);
            return TagInfo::default();
        }
    };

    let duration_secs = {
        let secs = tagged_file.properties().duration().as_secs_f64();
        if secs > 0.0 { Some(secs) } else { None }
    };

    // Try primary tag, then fall back
    let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
        return TagInfo {
            duration_secs,
            ..TagInfo::default()
        };
    };

    let clean = |s: std::borrow::Cow<'_, str>| {
        let s = s.trim().to_string();
        if s.is_empty() { None } else { Some(s) }
    };

    TagInfo {
        title: tag.title().and_then(clean),
        artist: tag.artist().and_then(clean),
        duration_secs,
    }
}

/// Title for a new track: tags first, then the file stem.
pub fn track_title(path: &Path) -> Option<String> {
    read_tags(path).display_title().or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.replace('_', " "))
    })
}
