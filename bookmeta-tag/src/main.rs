//! bookmeta-tag - audiobook metadata tool
//!
//! Thin command-line entry point: loads configuration, installs logging and
//! drives the improver pipeline and backend dispatcher.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use bookmeta_common::config::load_config;
use bookmeta_common::timecode::format_compact;
use bookmeta_tag::improvers::{
    ChapterLengthImprover, ChapterListImprover, CoverImprover, CueSheetImprover,
    DescriptionImprover, EmbeddedTagImprover, FfmetadataImprover, OverrideImprover,
    SilenceSnapImprover,
};
use bookmeta_tag::{
    BackendDispatcher, ConversionOptions, Cover, ExportOptions, ImproveContext, MetadataRecord,
    Pipeline, TagFlags,
};

/// Command-line arguments for bookmeta-tag
#[derive(Parser, Debug)]
#[command(name = "bookmeta-tag")]
#[command(about = "Enrich and write audiobook metadata")]
#[command(version)]
struct Args {
    /// Configuration file (overrides BOOKMETA_CONFIG and the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the configured level; RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read, improve and write the tags of an audio file
    Meta(MetaArgs),
    /// Export companion files from an audio file
    Export(ExportArgs),
    /// Print the duration of an audio file
    Duration {
        input: PathBuf,
        /// Measure by decoding instead of reading headers
        #[arg(long)]
        exact: bool,
    },
    /// Convert an audio file
    Convert(ConvertArgs),
    /// Import a chapter list or cover image into an audio file
    Import(ImportArgs),
}

#[derive(clap::Args, Debug)]
struct MetaArgs {
    input: PathBuf,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    artist: Option<String>,
    #[arg(long)]
    album: Option<String>,
    #[arg(long)]
    writer: Option<String>,
    #[arg(long)]
    genre: Option<String>,
    #[arg(long)]
    series: Option<String>,
    #[arg(long)]
    series_part: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    year: Option<String>,
    #[arg(long)]
    cover: Option<PathBuf>,
    /// Field or property names to strip from the file
    #[arg(long = "remove")]
    remove: Vec<String>,
    /// Move chapter starts into nearby silences
    #[arg(long)]
    snap_silences: bool,
    /// Write per-improver snapshots into this directory
    #[arg(long)]
    debug_dir: Option<PathBuf>,
    /// Print the improved record without writing
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    debug: bool,
    /// Series-ordered sort names for players that only sort by title
    #[arg(long)]
    adjust_for_constrained_players: bool,
    #[arg(long)]
    use_existing_files: bool,
    #[arg(long)]
    prepend_series_to_long_description: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ExportTarget {
    Cover,
    Chapters,
    Description,
    Ffmetadata,
    All,
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    input: PathBuf,
    #[arg(value_enum, default_value = "all")]
    target: ExportTarget,
    /// Directory for exported files (defaults to the input's directory)
    #[arg(long)]
    directory: Option<PathBuf>,
    /// File name prefix
    #[arg(long)]
    prefix: Option<String>,
    #[arg(short, long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct ImportArgs {
    input: PathBuf,
    /// Chapter list replacing the file's chapters
    #[arg(long)]
    chapters: Option<PathBuf>,
    /// Image embedded as cover
    #[arg(long)]
    cover: Option<PathBuf>,
    /// Clear the chapters when the chapter list is empty
    #[arg(short, long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    source: PathBuf,
    destination: PathBuf,
    #[arg(long)]
    bitrate: Option<u32>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    channels: Option<u32>,
    /// VBR quality 0-100; 0 means constant bitrate
    #[arg(long, default_value_t = 0.0)]
    vbr_quality: f64,
    #[arg(long)]
    codec: Option<String>,
    #[arg(long)]
    profile: Option<String>,
    #[arg(short, long)]
    force: bool,
    /// Directory for intermediate files
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    bookmeta_common::logging::init(&level).context("Failed to initialize logging")?;

    info!("bookmeta-tag {}", env!("CARGO_PKG_VERSION"));
    let dispatcher = Arc::new(BackendDispatcher::from_config(&config));

    match args.command {
        Command::Meta(meta) => run_meta(dispatcher, meta).await,
        Command::Export(export) => run_export(&dispatcher, export).await,
        Command::Duration { input, exact } => {
            let duration = if exact {
                dispatcher.inspect_exact_duration(&input).await?
            } else {
                dispatcher.estimate_duration(&input).await?
            };
            match duration {
                Some(d) => println!("{}", bookmeta_common::timecode::format_timecode(d)),
                None => anyhow::bail!("Could not determine duration of {}", input.display()),
            }
            Ok(())
        }
        Command::Convert(convert) => run_convert(&dispatcher, convert).await,
        Command::Import(import) => run_import(&dispatcher, import).await,
    }
}

async fn run_meta(dispatcher: Arc<BackendDispatcher>, args: MetaArgs) -> Result<()> {
    let mut overrides = MetadataRecord {
        title: args.title,
        artist: args.artist,
        album: args.album,
        writer: args.writer,
        genre: args.genre,
        series: args.series,
        series_part: args.series_part,
        description: args.description,
        year: args.year,
        cover: args.cover.map(Cover::File),
        ..Default::default()
    };
    overrides.remove_properties.extend(args.remove);

    let flags = TagFlags {
        force: false,
        debug: args.debug,
        adjust_for_constrained_players: args.adjust_for_constrained_players,
        use_existing_files: args.use_existing_files,
        prepend_series_to_long_description: args.prepend_series_to_long_description,
    };

    let mut pipeline = Pipeline::new()
        .add(EmbeddedTagImprover::new(dispatcher.clone()))
        .add(FfmetadataImprover)
        .add(CueSheetImprover)
        .add(ChapterListImprover)
        .add(DescriptionImprover)
        .add(CoverImprover)
        .add(OverrideImprover::new(overrides))
        .add(ChapterLengthImprover::new(dispatcher.clone()));
    if args.snap_silences {
        pipeline = pipeline.add(SilenceSnapImprover::new(dispatcher.clone()));
    }
    if let Some(dir) = args.debug_dir {
        pipeline = pipeline.with_debug_dir(dir);
    }

    let mut record = MetadataRecord::default();
    let mut ctx = ImproveContext::new(&args.input);
    pipeline
        .run(&mut record, &mut ctx)
        .await
        .with_context(|| format!("Failed to improve {}", args.input.display()))?;

    if args.dry_run {
        print!("{}", record);
        return Ok(());
    }

    dispatcher
        .write_tag(&args.input, &record, &flags)
        .await
        .with_context(|| format!("Failed to write tags to {}", args.input.display()))?;
    info!(file = %args.input.display(), "Done");
    Ok(())
}

async fn run_export(dispatcher: &BackendDispatcher, args: ExportArgs) -> Result<()> {
    let options = ExportOptions {
        destination: None,
        directory: args.directory,
        prefix: args.prefix,
        force: args.force,
    };
    let all = args.target == ExportTarget::All;

    if all || args.target == ExportTarget::Cover {
        match dispatcher.export_cover(&args.input, &options).await {
            Ok(path) => println!("{}", path.display()),
            // a book without cover art is not a failure when exporting everything
            Err(e) if all => tracing::warn!(error = %e, "Cover not exported"),
            Err(e) => return Err(e.into()),
        }
    }
    if all || args.target == ExportTarget::Chapters {
        println!("{}", dispatcher.export_chapters(&args.input, &options).await?.display());
    }
    if all || args.target == ExportTarget::Description {
        println!("{}", dispatcher.export_description(&args.input, &options).await?.display());
    }
    if all || args.target == ExportTarget::Ffmetadata {
        println!("{}", dispatcher.export_ffmetadata(&args.input, &options).await?.display());
    }
    Ok(())
}

async fn run_convert(dispatcher: &BackendDispatcher, args: ConvertArgs) -> Result<()> {
    let format = args
        .destination
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .context("Destination needs a file extension")?;

    let options = ConversionOptions {
        source: args.source,
        destination: args.destination,
        format,
        codec: args.codec,
        profile: args.profile,
        bitrate_kbps: args.bitrate,
        sample_rate: args.sample_rate,
        channels: args.channels,
        vbr_quality: args.vbr_quality,
        force: args.force,
        debug: args.debug,
        temp_dir: args.temp_dir,
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let job = dispatcher.convert_file(&options).await?;
    info!(tool = job.tool(), "Waiting for conversion");
    let destination = job.wait().await?;
    info!(elapsed = %format_compact(started.elapsed()), "Converted");
    println!("{}", destination.display());
    Ok(())
}

async fn run_import(dispatcher: &BackendDispatcher, args: ImportArgs) -> Result<()> {
    if args.chapters.is_none() && args.cover.is_none() {
        anyhow::bail!("Nothing to import, pass --chapters and/or --cover");
    }
    let flags = TagFlags {
        force: args.force,
        ..Default::default()
    };

    if let Some(chapters) = &args.chapters {
        dispatcher
            .import_chapters(&args.input, chapters, &flags)
            .await
            .with_context(|| format!("Failed to import {}", chapters.display()))?;
    }
    if let Some(cover) = &args.cover {
        dispatcher
            .import_cover(&args.input, cover, &flags)
            .await
            .with_context(|| format!("Failed to import {}", cover.display()))?;
    }
    Ok(())
}
