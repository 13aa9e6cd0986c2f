//! Sidecar files written next to the assembled output

use super::format::with_extension_appended;
use crate::error::{Error, Result};
use crate::types::EpisodeMetadata;
use std::path::{Path, PathBuf};

/// Move a file, falling back to copy + delete across filesystems
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::disk(parent, e))?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| Error::disk(to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| Error::disk(from, e))
        }
        Err(e) => Err(Error::disk(to, e)),
    }
}

/// `<stem>.<lang>.srt`, or `<stem>.srt` without a language
pub fn subtitle_path(stem: &Path, language: Option<&str>) -> PathBuf {
    match language {
        Some(lang) if !lang.is_empty() => with_extension_appended(stem, &format!("{lang}.srt")),
        _ => with_extension_appended(stem, "srt"),
    }
}

/// Move a downloaded subtitle stream into place
pub async fn write_subtitle(temp: &Path, stem: &Path, language: Option<&str>) -> Result<PathBuf> {
    let target = subtitle_path(stem, language);
    move_file(temp, &target).await?;
    Ok(target)
}

/// Write Kodi-style `<stem>.nfo` metadata
pub async fn write_nfo(stem: &Path, metadata: &EpisodeMetadata) -> Result<PathBuf> {
    let target = with_extension_appended(stem, "nfo");
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::disk(parent, e))?;
    }
    tokio::fs::write(&target, render_nfo(metadata))
        .await
        .map_err(|e| Error::disk(&target, e))?;
    Ok(target)
}

fn render_nfo(metadata: &EpisodeMetadata) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    xml.push_str("<episodedetails>\n");
    push_element(&mut xml, "title", &metadata.title);
    if let Some(plot) = &metadata.plot {
        push_element(&mut xml, "plot", plot);
    }
    if let Some(premiered) = &metadata.premiered {
        push_element(&mut xml, "premiered", premiered);
    }
    for tag in &metadata.tags {
        push_element(&mut xml, "tag", tag);
    }
    for actor in &metadata.actors {
        xml.push_str("  <actor>\n  ");
        push_element(&mut xml, "name", actor);
        xml.push_str("  </actor>\n");
    }
    if let Some(url) = &metadata.source_url {
        push_element(&mut xml, "website", url);
    }
    xml.push_str("</episodedetails>\n");
    xml
}

fn push_element(xml: &mut String, name: &str, text: &str) {
    xml.push_str("  <");
    xml.push_str(name);
    xml.push('>');
    xml.push_str(&escape_xml(text));
    xml.push_str("</");
    xml.push_str(name);
    xml.push_str(">\n");
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
