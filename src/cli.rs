use crate::{
    format_bytes, format_duration, CancellationScope, Config, ContentCategory, ReuploadCache,
    RunContext, ScreenshotService, SourceDescriptor, SourceKind, TrackerScope,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "release-screens")]
#[command(about = "Capture, validate and host screenshots of a video release")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Scratch directory for captured frames")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory holding the re-upload cache")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrent frame captures")]
    pub max_concurrent: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture screenshots and upload them to an image host
    Run {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        scope: ScopeArgs,

        #[command(flatten)]
        batch: BatchArgs,

        #[arg(long, help = "Upload to this host only, without failover")]
        host: Option<String>,

        #[arg(
            long = "approved-host",
            help = "Host accepted by the tracker (repeatable; default: all configured)"
        )]
        approved_hosts: Vec<String>,
    },

    /// Capture, optimize and validate screenshots without uploading
    Capture {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        scope: ScopeArgs,

        #[command(flatten)]
        batch: BatchArgs,

        #[arg(long, help = "Validate sizes against this host's policy")]
        host: Option<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(value_name = "FILE", help = "Configuration file to validate")]
        path: PathBuf,
    },

    /// Inspect or clear the re-upload cache of a release
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Recompress PNG paths read from stdin (started by the optimization pool)
    #[command(name = "optimize-worker", hide = true)]
    OptimizeWorker,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Print the cached records of a release
    Show {
        #[arg(long, help = "Release key")]
        release: String,
    },

    /// Forget the cached records of one tracker scope
    Invalidate {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    #[arg(short, long, help = "Video file, disc playlist or VOB to capture from")]
    pub source: PathBuf,

    #[arg(long, help = "Title duration in seconds")]
    pub duration: f64,

    #[arg(long, help = "Frame rate")]
    pub fps: f64,

    #[arg(long, value_enum, default_value = "file", help = "Source container")]
    pub kind: SourceKindArg,

    #[arg(long, help = "Television content")]
    pub tv: bool,

    #[arg(long, help = "Title is HDR")]
    pub hdr: bool,

    #[arg(long, help = "Video codec name, e.g. hevc or vc1")]
    pub codec: Option<String>,

    #[arg(long, default_value = "1920", help = "Frame width")]
    pub width: u32,

    #[arg(long, default_value = "1080", help = "Frame height")]
    pub height: u32,
}

impl SourceArgs {
    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            path: self.source.clone(),
            duration_secs: self.duration,
            frame_rate: self.fps,
            kind: self.kind.into(),
            category: if self.tv {
                ContentCategory::Tv
            } else {
                ContentCategory::Movie
            },
            hdr: self.hdr,
            codec: self.codec.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    #[arg(long, help = "Release key")]
    pub release: String,

    #[arg(long, help = "Destination tracker")]
    pub tracker: String,

    #[arg(long, help = "External release page the images belong to")]
    pub release_url: Option<String>,
}

impl ScopeArgs {
    pub fn scope(&self) -> TrackerScope {
        let mut scope = TrackerScope::new(self.release.clone(), self.tracker.clone());
        scope.release_url = self.release_url.clone();
        scope
    }
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(short = 'n', long, help = "Screenshots requested")]
    pub count: Option<usize>,

    #[arg(long, default_value = "0", help = "Screenshots already satisfied elsewhere")]
    pub already: usize,

    #[arg(long, default_value = "0", help = "Retake wave; shifts the capture window")]
    pub retake_ordinal: u32,

    #[arg(long, help = "Burn frame details into each screenshot")]
    pub overlay: bool,

    #[arg(long, help = "Keep HDR colours instead of tone-mapping")]
    pub no_tonemap: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKindArg {
    File,
    Bluray,
    Dvd,
}

impl From<SourceKindArg> for SourceKind {
    fn from(kind: SourceKindArg) -> Self {
        match kind {
            SourceKindArg::File => SourceKind::File,
            SourceKindArg::Bluray => SourceKind::Bluray,
            SourceKindArg::Dvd => SourceKind::Dvd,
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    scope: CancellationScope,
}

impl CliRunner {
    pub fn new(mut config: Config, args: &Cli, scope: CancellationScope) -> Self {
        if let Some(dir) = &args.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        if let Some(dir) = &args.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(max_concurrent) = args.max_concurrent {
            config.capture.max_concurrent_captures = max_concurrent;
        }
        if args.verbose {
            config.debug = true;
        }

        Self { config, scope }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run {
                source,
                scope,
                batch,
                host,
                approved_hosts,
            } => {
                let approved = (!approved_hosts.is_empty()).then_some(approved_hosts);
                self.run_upload(&source, &scope, &batch, host, approved).await
            }
            Commands::Capture {
                source,
                scope,
                batch,
                host,
            } => self.run_capture(&source, &scope, &batch, host).await,
            Commands::Validate { path } => self.validate_config(path).await,
            Commands::Cache { action } => self.run_cache(action).await,
            Commands::OptimizeWorker => {
                bail!("optimize-worker is started by the optimization pool, not by hand")
            }
        }
    }

    /// Run context for one invocation, with the batch flags applied.
    pub fn context(&self, scope: &ScopeArgs, batch: &BatchArgs) -> RunContext {
        let mut ctx = RunContext::from_config(&self.config, scope.scope());
        if let Some(count) = batch.count {
            ctx.requested_count = count;
        }
        ctx.already_satisfied = batch.already;
        ctx.retake_ordinal = batch.retake_ordinal;
        ctx.overlay |= batch.overlay;
        if batch.no_tonemap {
            ctx.tonemap = false;
        }
        ctx
    }

    async fn run_upload(
        &self,
        source: &SourceArgs,
        scope: &ScopeArgs,
        batch: &BatchArgs,
        host: Option<String>,
        approved_hosts: Option<Vec<String>>,
    ) -> Result<()> {
        if let Some(name) = &host {
            if self.config.host(name).is_none() {
                bail!("host '{}' is not configured", name);
            }
        }

        let mut ctx = self.context(scope, batch);
        ctx.explicit_host = host;
        ctx.approved_hosts = approved_hosts;

        let service = ScreenshotService::new(self.config.clone(), self.scope.clone())?;
        let started = Instant::now();
        let outcome = service
            .capture_and_upload_batch(&ctx, &source.descriptor())
            .await
            .context("screenshot batch failed")?;

        println!("{}", serde_json::to_string_pretty(&outcome.records)?);
        for failure in &outcome.image_failures {
            warn!("{}", failure);
        }
        let snapshot = service.metrics().snapshot();
        info!("Batch finished in {}", format_duration(started.elapsed()));
        info!(
            "Captures: {} ({} failed), retakes: {}, uploads: {} ({} failed), failovers: {}",
            snapshot.captures,
            snapshot.capture_failures,
            snapshot.retakes,
            snapshot.uploads,
            snapshot.upload_failures,
            snapshot.failovers
        );

        if outcome.requested > 0 && outcome.success_count == 0 {
            bail!(
                "{}",
                outcome
                    .shortfall_reason
                    .unwrap_or_else(|| "no screenshots were uploaded".to_string())
            );
        }
        eprintln!("{}", outcome.summary());
        Ok(())
    }

    async fn run_capture(
        &self,
        source: &SourceArgs,
        scope: &ScopeArgs,
        batch: &BatchArgs,
        host: Option<String>,
    ) -> Result<()> {
        let mut ctx = self.context(scope, batch);
        ctx.explicit_host = host;

        let service = ScreenshotService::new(self.config.clone(), self.scope.clone())?;
        let captured = service
            .capture_screenshots(&ctx, &source.descriptor())
            .await
            .context("capture failed")?;

        for shot in &captured.screenshots {
            if let Some(path) = &shot.file_path {
                println!(
                    "{}\t{}\t{}",
                    shot.index,
                    crate::format_timestamp(shot.source_offset_seconds),
                    path.display()
                );
            }
        }
        for failure in &captured.failures {
            warn!("{}", failure);
        }
        if ctx.images_needed() > 0 && captured.screenshots.is_empty() {
            bail!("no screenshot passed validation");
        }
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::load(&config_path)
            .await
            .with_context(|| format!("cannot load {}", config_path.display()))?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Screenshots: {}", config.screenshot_count);
        println!("  Capture concurrency: {}", config.capture.max_concurrent_captures);
        println!(
            "  Optimization: {} (max {} workers)",
            if config.optimization.enabled { "on" } else { "off" },
            config.optimization.max_workers
        );
        println!(
            "  Size floor: {}, max retakes: {}",
            format_bytes(config.validation.min_valid_size),
            config.validation.max_retakes
        );
        println!(
            "  Upload: {} attempts, timeout {:?}",
            config.upload.retry_attempts, config.upload.unit_timeout
        );
        println!("  Hosts (failover order): {}", config.host_names().join(", "));

        Ok(())
    }

    async fn run_cache(&self, action: CacheAction) -> Result<()> {
        match action {
            CacheAction::Show { release } => {
                let cache = ReuploadCache::open(&self.config.cache_dir, &release).await?;
                println!("Cache: {}", cache.path().display());
                for (scope, records) in cache.entries() {
                    println!("{scope}: {} images", records.len());
                    for entry in records {
                        println!(
                            "  [{}] {} ({})",
                            entry.record.source_screenshot_index,
                            entry.record.raw_url,
                            entry.uploaded_at.to_rfc3339()
                        );
                    }
                }
            }
            CacheAction::Invalidate { scope } => {
                let scope = scope.scope();
                let mut cache = ReuploadCache::open(&self.config.cache_dir, &scope.release_key).await?;
                if cache.invalidate(&scope).await? {
                    println!("Invalidated {}", scope.cache_key());
                } else {
                    println!("Nothing cached for {}", scope.cache_key());
                }
            }
        }
        Ok(())
    }
}

/// Installs the fmt subscriber. Output goes to stderr; stdout carries results
/// and the worker protocol.
pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = parse(&[
            "release-screens",
            "--verbose",
            "run",
            "--source",
            "/media/title.m2ts",
            "--duration",
            "5400",
            "--fps",
            "23.976",
            "--kind",
            "bluray",
            "--hdr",
            "--release",
            "Some.Release",
            "--tracker",
            "tracker",
            "-n",
            "6",
            "--approved-host",
            "alpha",
            "--approved-host",
            "beta",
        ]);
        assert!(cli.verbose);
        let Commands::Run {
            source,
            batch,
            host,
            approved_hosts,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        let descriptor = source.descriptor();
        assert_eq!(descriptor.kind, SourceKind::Bluray);
        assert!(descriptor.hdr);
        assert_eq!(descriptor.category, ContentCategory::Movie);
        assert_eq!(batch.count, Some(6));
        assert!(host.is_none());
        assert_eq!(approved_hosts, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_context_applies_batch_flags() {
        let cli = parse(&[
            "release-screens",
            "--scratch-dir",
            "/tmp/rs-scratch",
            "capture",
            "--source",
            "/media/ep.mkv",
            "--duration",
            "1500",
            "--fps",
            "25",
            "--tv",
            "--release",
            "Show.S01E01",
            "--tracker",
            "tracker",
            "--release-url",
            "https://db.example/r/7",
            "--already",
            "1",
            "--retake-ordinal",
            "2",
            "--overlay",
            "--no-tonemap",
        ]);
        let runner = CliRunner::new(
            Config::default(),
            &cli,
            CancellationScope::new(Duration::from_millis(10)),
        );
        assert_eq!(runner.config.scratch_dir, PathBuf::from("/tmp/rs-scratch"));

        let Commands::Capture {
            source, scope, batch, ..
        } = cli.command
        else {
            panic!("expected capture");
        };
        assert_eq!(source.descriptor().category, ContentCategory::Tv);
        let ctx = runner.context(&scope, &batch);
        assert_eq!(ctx.requested_count, 4);
        assert_eq!(ctx.images_needed(), 3);
        assert_eq!(ctx.retake_ordinal, 2);
        assert!(ctx.overlay);
        assert!(!ctx.tonemap);
        assert_eq!(ctx.scope.cache_key(), "tracker@https://db.example/r/7");
    }

    #[test]
    fn test_worker_subcommand_is_hidden() {
        let cli = parse(&["release-screens", "optimize-worker"]);
        assert!(matches!(cli.command, Commands::OptimizeWorker));
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("optimize-worker"));
    }
}
