//! Danmaku converters

use super::DanmakuConverter;
use super::process::run_tool;
use crate::config::AssemblyConfig;
use crate::error::{AssemblyError, Error, Result};
use crate::types::Resolution;
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs an external program to convert danmaku
///
/// Arguments may contain the placeholders `{input}`, `{output}`, `{width}`
/// and `{height}`, substituted per call.
///
/// ```
/// use episode_dl::assembly::CommandConverter;
///
/// let converter = CommandConverter::new(
///     "danmaku2ass",
///     ["{input}", "-o", "{output}", "-s", "{width}x{height}"],
/// );
/// ```
#[derive(Clone, Debug)]
pub struct CommandConverter {
    program: PathBuf,
    args: Vec<String>,
    extension: String,
    timeout: Duration,
}

impl CommandConverter {
    /// Converter writing `.ass` files with the default timeout
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let defaults = AssemblyConfig::default();
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            extension: defaults.danmaku_extension,
            timeout: defaults.timeout,
        }
    }

    /// Take extension and timeout from config
    pub fn with_config(mut self, config: &AssemblyConfig) -> Self {
        self.extension = config.danmaku_extension.clone();
        self.timeout = config.timeout;
        self
    }

    /// Arguments with placeholders filled in
    ///
    /// Paths are substituted as `OsStr`, so non-UTF-8 names reach the
    /// program unchanged.
    pub fn expand_args(
        &self,
        input: &Path,
        output: &Path,
        resolution: Resolution,
    ) -> Vec<OsString> {
        let width = resolution.width.to_string();
        let height = resolution.height.to_string();
        let values = [
            ("{input}", input.as_os_str()),
            ("{output}", output.as_os_str()),
            ("{width}", OsStr::new(&width)),
            ("{height}", OsStr::new(&height)),
        ];
        self.args.iter().map(|arg| expand(arg, &values)).collect()
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "converter".to_string())
    }
}

fn expand(template: &str, values: &[(&str, &OsStr)]) -> OsString {
    let mut expanded = OsString::new();
    let mut rest = template;
    while let Some((at, name, value)) = values
        .iter()
        .filter_map(|&(name, value)| rest.find(name).map(|at| (at, name, value)))
        .min_by_key(|&(at, _, _)| at)
    {
        expanded.push(&rest[..at]);
        expanded.push(value);
        rest = &rest[at + name.len()..];
    }
    expanded.push(rest);
    expanded
}

#[async_trait]
impl DanmakuConverter for CommandConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tool = self.tool_name();
        let mut command = Command::new(&self.program);
        command.args(self.expand_args(input, output, resolution));
        run_tool(&tool, command, self.timeout, cancel).await?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(AssemblyError::MissingOutput {
                tool,
                path: output.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Keeps the raw danmaku data as an `.xml` sidecar
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughConverter;

#[async_trait]
impl DanmakuConverter for PassthroughConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        _resolution: Resolution,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::fs::copy(input, output)
            .await
            .map_err(|e| Error::disk(output, e))?;
        Ok(())
    }

    fn extension(&self) -> &str {
        "xml"
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn placeholders_are_expanded() {
        let converter = CommandConverter::new(
            "/usr/bin/danmaku2ass",
            ["{input}", "-o", "{output}", "-s", "{width}x{height}"],
        );
        let args = converter.expand_args(
            Path::new("/t/2_danmaku.part"),
            Path::new("/out/ep.ass"),
            Resolution {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!(
            args,
            ["/t/2_danmaku.part", "-o", "/out/ep.ass", "-s", "1280x720"].map(OsString::from)
        );
        assert_eq!(converter.extension(), "ass");
        assert_eq!(converter.tool_name(), "danmaku2ass");
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_passed_through() {
        use std::os::unix::ffi::{OsStrExt, OsStringExt};

        let converter = CommandConverter::new("danmaku2ass", ["--in={input}", "{output}"]);
        let input = Path::new(OsStr::from_bytes(b"/t/\xffep.part"));
        let args = converter.expand_args(input, Path::new("/out/ep.ass"), Resolution::default());

        assert_eq!(args[0].clone().into_vec(), b"--in=/t/\xffep.part");
        assert_eq!(args[1], OsString::from("/out/ep.ass"));
    }

    #[tokio::test]
    async fn passthrough_copies_raw_data() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("2_danmaku.part");
        let output = dir.path().join("ep.xml");
        tokio::fs::write(&input, b"<i><d p=\"0\">hi</d></i>").await.unwrap();

        PassthroughConverter
            .convert(
                &input,
                &output,
                Resolution::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(&output).await.unwrap(),
            tokio::fs::read(&input).await.unwrap()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_converter_runs_program() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("2_danmaku.part");
        let output = dir.path().join("ep.ass");
        tokio::fs::write(&input, b"raw").await.unwrap();

        let converter = CommandConverter::new("cp", ["{input}", "{output}"]);
        converter
            .convert(
                &input,
                &output,
                Resolution::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"raw");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_that_writes_nothing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let converter = CommandConverter::new("true", Vec::<String>::new());
        let err = converter
            .convert(
                &dir.path().join("in"),
                &dir.path().join("out.ass"),
                Resolution::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Assembly(AssemblyError::MissingOutput { .. })
        ));
    }
}
