//! Output container selection

use crate::config::{AssemblyConfig, OutputFormat};
use crate::types::StreamSpec;
use std::path::{Path, PathBuf};

/// Whether a site codec name denotes FLAC audio
pub fn is_flac(codec: Option<&str>) -> bool {
    codec.is_some_and(|c| c.eq_ignore_ascii_case("flac"))
}

/// Extension of the final output for the selected streams
///
/// With a video track the container is mp4, or mkv when the audio is FLAC
/// (mp4 cannot carry it). Audio-only episodes get aac, or flac for FLAC
/// audio. A fixed format in the config always wins.
pub fn output_extension(
    config: &AssemblyConfig,
    video: Option<&StreamSpec>,
    audio: Option<&StreamSpec>,
) -> String {
    let audio_is_flac = is_flac(audio.and_then(|a| a.codec.as_deref()));

    if video.is_some() {
        match &config.output_format {
            OutputFormat::Fixed(ext) => ext.clone(),
            OutputFormat::Infer if audio_is_flac => "mkv".to_string(),
            OutputFormat::Infer => "mp4".to_string(),
        }
    } else {
        match &config.output_format_audio_only {
            OutputFormat::Fixed(ext) => ext.clone(),
            OutputFormat::Infer if audio_is_flac => "flac".to_string(),
            OutputFormat::Infer => "aac".to_string(),
        }
    }
}

/// `stem` + `.` + `ext`, keeping any dots already in the stem
///
/// `Path::with_extension` would replace "S01.E02" with "S01.mp4".
pub fn with_extension_appended(stem: &Path, ext: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
