//! Higher-order docker operations
//!
//! Thin pass-through wrappers over `docker build|push|pull|tag|cp|logs|stats|
//! network|volume|compose`. The adapter adds argument validation, output
//! capture and error mapping; behaviour is otherwise the CLI's.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::{validate_container_name, DockerAdapter};
use crate::error::{Error, Result};
use crate::result::ExecResult;

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]*$").expect("image ref pattern"))
}

fn validate_image_ref(image: &str) -> Result<()> {
    if !image_pattern().is_match(image) {
        return Err(Error::InvalidArgument(format!(
            "invalid image reference: {:?}",
            image
        )));
    }
    Ok(())
}

/// Validate one side of a `docker cp` spec (`container:path` or a local
/// path).
fn validate_cp_spec(spec: &str) -> Result<()> {
    if let Some((container, path)) = spec.split_once(':') {
        validate_container_name(container)?;
        if path.split('/').any(|seg| seg == "..") {
            return Err(Error::InvalidArgument(format!(
                "path traversal in cp spec: {:?}",
                spec
            )));
        }
    }
    Ok(())
}

impl DockerAdapter {
    /// Run one docker CLI invocation, capturing output. Pass-through: the
    /// result carries whatever exit code the CLI produced.
    pub async fn op(&self, args: &[&str]) -> Result<ExecResult> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.cli_quiet(&owned).await
    }

    /// `docker build <context> [-t tag] [--build-arg K=V]…`
    pub async fn image_build(
        &self,
        context: &Path,
        tag: Option<&str>,
        build_args: &HashMap<String, String>,
    ) -> Result<ExecResult> {
        let mut args = vec!["build".to_string()];
        if let Some(tag) = tag {
            validate_image_ref(tag)?;
            args.push("-t".to_string());
            args.push(tag.to_string());
        }
        let mut keys: Vec<&String> = build_args.keys().collect();
        keys.sort();
        for key in keys {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, build_args[key]));
        }
        args.push(context.to_string_lossy().into_owned());
        self.cli_quiet(&args).await
    }

    pub async fn image_push(&self, image: &str) -> Result<ExecResult> {
        validate_image_ref(image)?;
        self.op(&["push", image]).await
    }

    pub async fn image_pull(&self, image: &str) -> Result<ExecResult> {
        validate_image_ref(image)?;
        self.op(&["pull", image]).await
    }

    pub async fn image_tag(&self, source: &str, target: &str) -> Result<ExecResult> {
        validate_image_ref(source)?;
        validate_image_ref(target)?;
        self.op(&["tag", source, target]).await
    }

    /// `docker cp src dst`, with container-side path validation.
    pub async fn cp(&self, src: &str, dst: &str) -> Result<ExecResult> {
        validate_cp_spec(src)?;
        validate_cp_spec(dst)?;
        self.op(&["cp", src, dst]).await
    }

    /// Non-following `docker logs`.
    pub async fn logs(
        &self,
        container: &str,
        tail: Option<u32>,
        timestamps: bool,
    ) -> Result<ExecResult> {
        validate_container_name(container)?;
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if timestamps {
            args.push("-t".to_string());
        }
        args.push(container.to_string());
        self.cli_quiet(&args).await
    }

    /// One-shot `docker stats` snapshot, parsed from its JSON format.
    pub async fn stats(&self, container: &str) -> Result<serde_json::Value> {
        validate_container_name(container)?;
        let result = self
            .op(&[
                "stats",
                "--no-stream",
                "--format",
                "{{json .}}",
                container,
            ])
            .await?;
        if result.exit_code != 0 {
            return Err(Error::TargetNotFound {
                target: container.to_string(),
                result: Some(Box::new(result)),
            });
        }
        result.json()
    }

    pub async fn network(&self, args: &[&str]) -> Result<ExecResult> {
        let mut full = vec!["network"];
        full.extend_from_slice(args);
        self.op(&full).await
    }

    pub async fn volume(&self, args: &[&str]) -> Result<ExecResult> {
        let mut full = vec!["volume"];
        full.extend_from_slice(args);
        self.op(&full).await
    }

    pub async fn compose(&self, args: &[&str]) -> Result<ExecResult> {
        let mut full = vec!["compose"];
        full.extend_from_slice(args);
        self.op(&full).await
    }

    /// Exec `argv` in `container` and parse stdout as JSON.
    ///
    /// Leading non-JSON lines (container warnings, banners) are skipped up to
    /// the first line starting with `{` or `[`; if no such line exists the
    /// call fails with `InvalidArgument`.
    pub async fn exec_json(&self, container: &str, argv: &[&str]) -> Result<serde_json::Value> {
        validate_container_name(container)?;
        let mut args = vec!["exec", container];
        args.extend_from_slice(argv);
        let result = self.op(&args).await?;
        if result.exit_code != 0 {
            return Err(Error::CommandFailed {
                command: result.command.clone(),
                exit_code: result.exit_code,
                result: Box::new(result),
            });
        }

        let text = result.stdout.as_text();
        let json_start = text
            .lines()
            .scan(0_usize, |offset, line| {
                let start = *offset;
                *offset += line.len() + 1;
                Some((start, line))
            })
            .find(|(_, line)| {
                let trimmed = line.trim_start();
                trimmed.starts_with('{') || trimmed.starts_with('[')
            })
            .map(|(start, _)| start);

        match json_start {
            Some(start) => serde_json::from_str(&text[start..])
                .map_err(|e| Error::InvalidArgument(format!("exec output is not JSON: {}", e))),
            None => Err(Error::InvalidArgument(
                "exec output contains no JSON document".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_validation() {
        assert!(validate_image_ref("alpine:3.20").is_ok());
        assert!(validate_image_ref("ghcr.io/acme/app:v1.2").is_ok());
        assert!(validate_image_ref("app@sha256:abcd").is_ok());

        assert!(validate_image_ref("").is_err());
        assert!(validate_image_ref("bad image").is_err());
        assert!(validate_image_ref("$(boom)").is_err());
    }

    #[test]
    fn test_cp_spec_validation() {
        assert!(validate_cp_spec("/tmp/file").is_ok());
        assert!(validate_cp_spec("web:/srv/app.log").is_ok());

        assert!(validate_cp_spec("web:/srv/../../etc/passwd").is_err());
        assert!(validate_cp_spec("bad name:/x").is_err());
    }
}
