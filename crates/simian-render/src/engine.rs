//! Render engine interface and the subprocess implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use simian_models::Combination;

use crate::command::{check_program, CommandRunner, RenderCommand};
use crate::error::{RenderError, RenderResult};

/// Renders one combination into a local video file.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Render `combination` into `output_dir`, returning the produced file.
    async fn render(&self, combination: &Combination, output_dir: &Path) -> RenderResult<PathBuf>;
}

/// Settings passed to every render invocation.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Program to run
    pub program: String,
    /// Arguments placed before the render flags
    pub program_args: Vec<String>,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// First animation frame
    pub start_frame: u32,
    /// Last animation frame
    pub end_frame: u32,
    /// Directory holding background HDRIs
    pub hdri_path: PathBuf,
    /// Kill the renderer after this long
    pub timeout: Option<Duration>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            program_args: vec!["-m".into(), "simian.render".into(), "--".into()],
            width: 1920,
            height: 1080,
            start_frame: 0,
            end_frame: 65,
            hdri_path: PathBuf::from("backgrounds"),
            timeout: None,
        }
    }
}

impl RenderSettings {
    /// Create settings from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("SIMIAN_RENDER_PROGRAM").unwrap_or(defaults.program),
            program_args: std::env::var("SIMIAN_RENDER_ARGS")
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or(defaults.program_args),
            width: std::env::var("SIMIAN_RENDER_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.width),
            height: std::env::var("SIMIAN_RENDER_HEIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.height),
            start_frame: std::env::var("SIMIAN_START_FRAME")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.start_frame),
            end_frame: std::env::var("SIMIAN_END_FRAME")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.end_frame),
            hdri_path: std::env::var("SIMIAN_HDRI_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.hdri_path),
            timeout: std::env::var("SIMIAN_RENDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs),
        }
    }
}

/// Render engine that shells out to an external renderer.
///
/// The renderer receives the combination as JSON and must write
/// `{output_dir}/{combination_id}.mp4`.
#[derive(Debug, Clone)]
pub struct CommandRenderEngine {
    settings: RenderSettings,
    runner: CommandRunner,
}

impl CommandRenderEngine {
    pub fn new(settings: RenderSettings) -> Self {
        let runner = CommandRunner::new().with_timeout(settings.timeout);
        Self { settings, runner }
    }

    pub fn from_env() -> Self {
        Self::new(RenderSettings::from_env())
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Fail fast when the render program is not installed.
    pub fn check_available(&self) -> RenderResult<PathBuf> {
        check_program(&self.settings.program)
    }

    /// Path the renderer is expected to write for `combination`.
    pub fn output_path(combination: &Combination, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.mp4", combination.id))
    }

    /// Build the command for one combination.
    pub fn build_command(&self, combination: &Combination, output_dir: &Path) -> RenderResult<RenderCommand> {
        validate_file_stem(combination)?;

        Ok(RenderCommand::new(&self.settings.program)
            .prefix_args(self.settings.program_args.iter().cloned())
            .flag("width", self.settings.width)
            .flag("height", self.settings.height)
            .flag("combination_index", &combination.id)
            .flag("output_dir", output_dir.display())
            .flag("hdri_path", self.settings.hdri_path.display())
            .flag("start_frame", self.settings.start_frame)
            .flag("end_frame", self.settings.end_frame)
            .flag("combination", combination.parameters_json()))
    }
}

/// The combination id names the output file, so it must stay inside `output_dir`.
fn validate_file_stem(combination: &Combination) -> RenderResult<()> {
    let id = combination.id.as_str();
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(RenderError::invalid_parameters(format!(
            "combination id {:?} is not a valid file name",
            id
        )));
    }
    Ok(())
}

#[async_trait]
impl RenderEngine for CommandRenderEngine {
    async fn render(&self, combination: &Combination, output_dir: &Path) -> RenderResult<PathBuf> {
        tokio::fs::create_dir_all(output_dir).await?;

        let output = Self::output_path(combination, output_dir);
        let cmd = self.build_command(combination, output_dir)?;

        let started = std::time::Instant::now();
        self.runner.run(&cmd).await?;

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(RenderError::OutputMissing(output));
        }

        info!(
            combination_id = %combination.id,
            output = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Render finished"
        );
        Ok(output)
    }
}
