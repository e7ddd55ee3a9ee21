use anyhow::{Context, Result, bail};
use dashcam_privacy::core_modules::frame::{Frame, Metrics, Orientation};
use dashcam_privacy::core_modules::geometry::BoundingBox;
use dashcam_privacy::core_modules::grid_manager::GridManager;
use dashcam_privacy::core_modules::redaction::{RedactionConfig, Redactor};
use dashcam_privacy::core_modules::utils::image_helper;
use dashcam_privacy::logging;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const USAGE: &str =
    "Usage: grid_preview <output_dir> [--size <model_px>] [--max-grid <n>] [--flip] [--box x0,y0,x1,y1]... <image>...";

struct Args {
    output_dir: PathBuf,
    model_size: u32,
    max_grid: u32,
    flip: bool,
    boxes: Vec<BoundingBox>,
    images: Vec<PathBuf>,
}

fn parse_box(value: &str) -> Result<BoundingBox> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid box '{value}'"))?;
    match parts.as_slice() {
        [x0, y0, x1, y1] => Ok(BoundingBox::new(*x0, *y0, *x1, *y1)),
        _ => bail!("a box needs four comma-separated numbers, got '{value}'"),
    }
}

fn parse_args() -> Result<Args> {
    let mut raw = env::args().skip(1);
    let output_dir = raw.next().map(PathBuf::from).context(USAGE)?;
    let mut args = Args {
        output_dir,
        model_size: 640,
        max_grid: 3,
        flip: false,
        boxes: Vec::new(),
        images: Vec::new(),
    };
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--size" => args.model_size = raw.next().context(USAGE)?.parse().context("invalid --size")?,
            "--max-grid" => args.max_grid = raw.next().context(USAGE)?.parse().context("invalid --max-grid")?,
            "--flip" => args.flip = true,
            "--box" => args.boxes.push(parse_box(&raw.next().context(USAGE)?)?),
            _ => args.images.push(PathBuf::from(arg)),
        }
    }
    if args.images.is_empty() {
        bail!(USAGE);
    }
    Ok(args)
}

fn frame_for(path: &Path, orientation: Orientation) -> Frame {
    Frame {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        storage_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        speed: 0.0,
        orientation,
        captured_at_ms: 0,
    }
}

fn main() -> Result<()> {
    logging::init();
    let args = parse_args()?;
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("cannot create {}", args.output_dir.display()))?;

    // The first image fixes the canonical frame size for the whole grid.
    let first = image_helper::load_rgb(&args.images[0])
        .with_context(|| format!("cannot read {}", args.images[0].display()))?;
    let (width, height) = first.dimensions();

    // --- Grid assembly ---
    let orientation = if args.flip {
        Orientation::UpsideDown
    } else {
        Orientation::Upright
    };
    let frames: Vec<Frame> = args.images.iter().map(|p| frame_for(p, orientation)).collect();
    let manager = GridManager::new(width, height, args.max_grid, true);
    let (batch, deferred) = manager.plan(frames);
    if !deferred.is_empty() {
        warn!(skipped = deferred.len(), capacity = manager.max_capacity(), "too many images for one grid");
    }
    let sources: Vec<PathBuf> = batch.frames.iter().map(Frame::durable_path).collect();
    let assembled = manager.assemble(&batch, &sources, args.model_size)?;
    for (index, message) in &assembled.load_errors {
        warn!(cell = index, "{message}");
    }

    let grid_path = args.output_dir.join("grid.png");
    image_helper::save_png(&grid_path, &assembled.canvas)?;
    let (columns, rows) = batch.geometry.scale();
    info!(
        path = %grid_path.display(),
        frames = batch.len(),
        columns,
        rows,
        empty_cells = batch.empty_cells(),
        elapsed_ms = assembled.elapsed.as_millis() as u64,
        "grid written"
    );

    // --- Redaction of the first frame ---
    if args.boxes.is_empty() {
        return Ok(());
    }
    let redactor = Redactor::new(RedactionConfig::default());
    let mut metrics = Metrics::new();
    let (redacted, strategy) = redactor.redact(&first, &args.boxes, &mut metrics);
    let redacted_path = args.output_dir.join("redacted.jpg");
    redactor.write(&redacted, &redacted_path, &mut metrics)?;
    info!(path = %redacted_path.display(), ?strategy, "redacted frame written");
    for (name, value) in metrics.iter() {
        info!(metric = name, value, "timing");
    }
    Ok(())
}
