use std::fs;
use std::process::Command;

use tracing::debug;

use crate::config::RenderSection;
use crate::error::PipelineError;

/// Produces a raster preview for a native diagram.
pub trait PreviewRenderer: Send + Sync {
    fn render_preview(
        &self,
        space_key: &str,
        page_id: &str,
        native: &[u8],
    ) -> Result<Vec<u8>, PipelineError>;

    /// `false` makes the crawl skip rendering instead of recording a failure per diagram.
    fn is_enabled(&self) -> bool {
        true
    }
}

pub fn renderer_from_config(config: &RenderSection) -> Box<dyn PreviewRenderer> {
    match config.command.as_deref().map(str::trim) {
        Some(command) if !command.is_empty() => Box::new(CommandRenderer {
            program: command.to_string(),
            args: if config.args.is_empty() {
                default_export_args()
            } else {
                config.args.clone()
            },
        }),
        _ => Box::new(DisabledRenderer),
    }
}

/// Used when no export command is configured; every diagram ends up without preview.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledRenderer;

impl PreviewRenderer for DisabledRenderer {
    fn is_enabled(&self) -> bool {
        false
    }

    fn render_preview(
        &self,
        _space_key: &str,
        _page_id: &str,
        _native: &[u8],
    ) -> Result<Vec<u8>, PipelineError> {
        Err(PipelineError::RenderFailed(
            "no preview renderer configured".to_string(),
        ))
    }
}

/// Runs an external exporter (the draw.io desktop CLI) on a temp copy of the diagram.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    pub program: String,
    /// `{input}` and `{output}` are substituted with temp file paths.
    pub args: Vec<String>,
}

fn default_export_args() -> Vec<String> {
    ["--export", "--format", "png", "--output", "{output}", "{input}"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl PreviewRenderer for CommandRenderer {
    fn render_preview(
        &self,
        space_key: &str,
        page_id: &str,
        native: &[u8],
    ) -> Result<Vec<u8>, PipelineError> {
        let failed = |detail: String| {
            PipelineError::RenderFailed(format!("{space_key}/{page_id}: {detail}"))
        };
        let workdir = tempfile::tempdir()
            .map_err(|err| failed(format!("failed to create temp dir: {err}")))?;
        let input = workdir.path().join("diagram.drawio");
        let output = workdir.path().join("preview.png");
        fs::write(&input, native).map_err(|err| failed(format!("failed to stage input: {err}")))?;

        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input_arg)
                    .replace("{output}", &output_arg)
            })
            .collect();

        debug!(program = %self.program, ?args, "rendering preview");
        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|err| failed(format!("failed to run {}: {err}", self.program)))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(failed(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            )));
        }

        let image = fs::read(&output)
            .map_err(|err| failed(format!("exporter produced no output: {err}")))?;
        if image.is_empty() {
            return Err(failed("exporter produced an empty image".to_string()));
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandRenderer, PreviewRenderer, renderer_from_config};
    use crate::config::RenderSection;
    use crate::error::PipelineError;

    #[test]
    fn unconfigured_renderer_always_fails() {
        let renderer = renderer_from_config(&RenderSection::default());
        assert!(!renderer.is_enabled());
        assert!(matches!(
            renderer.render_preview("DEMO", "1", b"<mxfile/>"),
            Err(PipelineError::RenderFailed(_))
        ));
    }

    #[test]
    fn missing_program_is_a_render_failure() {
        let renderer = CommandRenderer {
            program: "drawsync-no-such-exporter".to_string(),
            args: vec!["{input}".to_string()],
        };
        let err = renderer
            .render_preview("DEMO", "1", b"<mxfile/>")
            .expect_err("must fail");
        assert!(err.to_string().contains("DEMO/1"));
    }

    #[cfg(unix)]
    #[test]
    fn command_output_file_becomes_the_preview() {
        let renderer = CommandRenderer {
            program: "cp".to_string(),
            args: vec!["{input}".to_string(), "{output}".to_string()],
        };
        let image = renderer
            .render_preview("DEMO", "1", b"fake-png-bytes")
            .expect("render");
        assert_eq!(image, b"fake-png-bytes");
    }
}
