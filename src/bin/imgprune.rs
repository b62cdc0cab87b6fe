use std::{
    fs::File,
    future::Future,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use clap::{ArgAction, Parser};
use log::{info, warn, LevelFilter};
use reqwest::Client;

use imageprune::{
    config::parse_duration,
    describe::DescribingDeleter,
    protocol::{RegistryBlobDeleter, RegistryLayerLinkDeleter, RegistryManifestDeleter},
    store::SnapshotStore,
    Plan, PruneOptions, Pruner, Snapshot,
};

/// imgprune
#[derive(Debug, Parser)]
#[clap(name = "imgprune", version)]
pub struct App {
    /// JSON export of all images, image streams, pods, controllers, builds and limit ranges
    #[clap(long)]
    snapshot: PathBuf,
    /// TOML file with pruning settings; flags take precedence
    #[clap(long)]
    config: Option<PathBuf>,
    /// Keep images, streams and terminated pods younger than this (e.g. 60m, 1h30m)
    #[clap(long, value_parser = parse_duration)]
    keep_younger_than: Option<TimeDelta>,
    /// Keep this many of the most recent revisions of each tag
    #[clap(long)]
    keep_tag_revisions: Option<usize>,
    /// Prune images exceeding their namespace's image size limit instead
    #[clap(long, conflicts_with_all = ["keep_younger_than", "keep_tag_revisions"])]
    prune_over_size_limit: bool,
    /// Also prune images that weren't pushed to the integrated registry
    #[clap(long)]
    all_images: Option<bool>,
    /// Only remove image references from image streams in this namespace
    #[clap(long)]
    namespace: Option<String>,
    /// Registry to prune from, as host[:port]
    #[clap(long)]
    registry_url: Option<String>,
    /// Fall back to plain http when https doesn't work
    #[clap(long)]
    insecure: bool,
    /// Actually delete; without this only the deletions are printed
    #[clap(long)]
    confirm: bool,
    /// Where to write the updated snapshot (default: stdout)
    #[clap(long)]
    output: Option<PathBuf>,
    /// Give up after this many seconds
    #[clap(long)]
    timeout: Option<u64>,
    /// More logging; repeat for more detail
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl App {
    fn options(&self) -> Result<PruneOptions> {
        let mut options = match &self.config {
            Some(path) => PruneOptions::load(path)?,
            None => PruneOptions::default(),
        };

        if let Some(keep_younger_than) = self.keep_younger_than {
            options.keep_younger_than = keep_younger_than;
        }
        if let Some(keep_tag_revisions) = self.keep_tag_revisions {
            options.keep_tag_revisions = keep_tag_revisions;
        }
        if let Some(all_images) = self.all_images {
            options.all_images = all_images;
        }
        if self.namespace.is_some() {
            options.namespace.clone_from(&self.namespace);
        }
        if self.registry_url.is_some() {
            options.registry_url.clone_from(&self.registry_url);
        }
        options.prune_over_size_limit |= self.prune_over_size_limit;
        options.insecure |= self.insecure;
        options.dry_run = !self.confirm;

        if options.keep_younger_than < TimeDelta::zero() {
            bail!("--keep-younger-than must not be negative");
        }
        Ok(options)
    }
}

fn print_plan(plan: &Plan) {
    info!(
        "Would prune {} images and {} image components",
        plan.images.len(),
        plan.components.len()
    );
    for image in &plan.images {
        info!("  {}", image.name());
    }
}

/// Runs `future` unless interrupted or out of time.
async fn interruptible<T>(timeout: Option<u64>, future: impl Future<Output = T>) -> Result<T> {
    let deadline = async {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = future => Ok(result),
        _ = tokio::signal::ctrl_c() => bail!("Interrupted"),
        _ = deadline => bail!("Timed out"),
    }
}

fn write_snapshot(snapshot: &Snapshot, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, snapshot)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = App::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match args.verbose {
        0 => {}
        1 => {
            logger.filter_level(LevelFilter::Debug);
        }
        _ => {
            logger.filter_level(LevelFilter::Trace);
        }
    }
    logger.init();

    let options = args.options()?;
    let snapshot = Snapshot::load(&args.snapshot)?;
    let client = Client::builder()
        .build()
        .context("Creating registry client")?;

    if options.dry_run {
        let mut pruner = Pruner::new(snapshot, options, client);
        print_plan(&pruner.plan());
        let describe = DescribingDeleter::stdout();
        interruptible(
            args.timeout,
            pruner.prune(&describe, &describe, &describe, &describe, &describe),
        )
        .await??;
        warn!("Dry run; nothing was deleted.  Add --confirm to prune.");
        return Ok(());
    }

    let store = SnapshotStore::new(snapshot.clone());
    let mut pruner = Pruner::new(snapshot, options, client);
    let result = interruptible(
        args.timeout,
        pruner.prune(
            &store,
            &store,
            &RegistryLayerLinkDeleter,
            &RegistryBlobDeleter,
            &RegistryManifestDeleter,
        ),
    )
    .await;

    // whatever got done is written out, so that a rerun starts from there
    write_snapshot(&store.into_snapshot(), args.output.as_deref())?;
    result??;
    Ok(())
}
