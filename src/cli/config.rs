//! Conversion of CLI arguments into a removal configuration

use crate::cli::main_impl::{Cli, CliModel};
use crate::config::{ModelVariant, RemovalConfig, RemovalConfigBuilder};
use crate::services::ProgressCallback;
use anyhow::{Context, Result};
use std::time::Duration;

impl From<CliModel> for ModelVariant {
    fn from(model: CliModel) -> Self {
        match model {
            CliModel::Small => Self::Small,
            CliModel::Medium => Self::Medium,
        }
    }
}

/// Collects global flags plus per-command options
pub(crate) struct CliConfigBuilder<'a> {
    cli: &'a Cli,
    model: CliModel,
    proxy_to_worker: bool,
    progress: Option<ProgressCallback>,
}

impl<'a> CliConfigBuilder<'a> {
    pub(crate) fn new(cli: &'a Cli) -> Self {
        Self {
            cli,
            model: CliModel::Medium,
            proxy_to_worker: false,
            progress: None,
        }
    }

    pub(crate) fn model(mut self, model: CliModel) -> Self {
        self.model = model;
        self
    }

    pub(crate) fn proxy_to_worker(mut self, proxy: bool) -> Self {
        self.proxy_to_worker = proxy;
        self
    }

    pub(crate) fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Build the configuration
    ///
    /// `-v` turns on debug mode. Headers are given as `NAME:VALUE`.
    pub(crate) fn build(self) -> Result<RemovalConfig> {
        let mut builder: RemovalConfigBuilder = RemovalConfig::builder()
            .debug(self.cli.verbose > 0)
            .model(self.model.into())
            .proxy_to_worker(self.proxy_to_worker);

        match &self.cli.public_path {
            Some(public_path) => builder = builder.public_path(public_path.as_str()),
            None => log::warn!(
                "No --public-path given; only cached assets or absolute asset URLs can be used"
            ),
        }

        for header in &self.cli.headers {
            let (name, value) = parse_header(header)?;
            builder = builder.header(name, value);
        }
        if let Some(seconds) = self.cli.timeout {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        if let Some(progress) = self.progress {
            builder = builder.progress(progress);
        }

        builder.build().context("Failed to build configuration")
    }
}

/// Split `NAME:VALUE`, trimming whitespace around both parts
fn parse_header(header: &str) -> Result<(&str, &str)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("Header '{}' is not in NAME:VALUE form", header))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header '{}' has an empty name", header);
    }
    Ok((name, value.trim()))
}
