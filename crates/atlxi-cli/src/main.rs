mod synth;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use atlxi_core::kernels::{P_VALUE, SLOPE};
use atlxi_core::{
    named_regions, rasterize_mean, CheckpointMode, ChunkStore, Grid, Pipeline, PipelineConfig,
    PipelineInput, PipelineOutput, Region, RegionSpec, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "ICESat-2 ATL11 per-point height change", long_about = None)]
struct Cli {
    /// Log filter, e.g. `debug` or `atlxi_core=trace`. Defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic input store.
    Synth(SynthArgs),
    /// Run range and dh/dt passes over an input store.
    Run(RunArgs),
    /// List the named regions.
    Regions,
}

#[derive(clap::Args, Debug)]
struct SynthArgs {
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    output: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    points: usize,

    #[arg(long, default_value_t = 6)]
    cycles: usize,

    /// Points per chunk; defaults to `chunk_points` from the config.
    #[arg(long)]
    chunk_points: Option<usize>,

    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CheckpointOpt {
    Use,
    Refresh,
    Off,
}

impl From<CheckpointOpt> for CheckpointMode {
    fn from(o: CheckpointOpt) -> Self {
        match o {
            CheckpointOpt::Use => CheckpointMode::Use,
            CheckpointOpt::Refresh => CheckpointMode::Refresh,
            CheckpointOpt::Off => CheckpointMode::Off,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    input: PathBuf,

    /// JSON pipeline config; flags below override it.
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Named region key (see `atlxi regions`).
    #[arg(long)]
    region: Option<String>,

    /// Worker threads; 0 = one per core.
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    range_threshold: Option<f64>,

    #[arg(long, value_hint = ValueHint::DirPath)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    checkpoint: Option<CheckpointOpt>,

    /// Write `h_range.json` and `dhdt_slope.json` grids here.
    #[arg(long, value_hint = ValueHint::DirPath)]
    grid_dir: Option<PathBuf>,

    /// Grid cell size in metres.
    #[arg(long, default_value_t = 1_000.0)]
    cell_size: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("bad --log-level '{level}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Synth(args) => handle_synth(args),
        Command::Run(args) => handle_run(args),
        Command::Regions => {
            print_regions();
            Ok(())
        }
    }
}

fn handle_synth(args: SynthArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let store = synth::write_store(
        &args.output,
        &synth::SynthParams {
            points: args.points,
            cycles: args.cycles,
            chunk_points: args.chunk_points.unwrap_or(config.chunk_points),
            seed: args.seed,
        },
    )?;
    info!(
        path = %store.root().display(),
        points = store.manifest().n_points,
        cycles = store.cycles().len(),
        chunks = store.manifest().chunks.len(),
        "synthetic store written"
    );
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(region) = &args.region {
        config.region = Some(RegionSpec::Named(region.clone()));
    }
    if let Some(n) = args.workers {
        config.workers = n;
    }
    if let Some(t) = args.range_threshold {
        config.range_threshold = t;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint.dir = Some(dir.clone());
    }
    if let Some(mode) = args.checkpoint {
        config.checkpoint.mode = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn handle_run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let region = config.region()?.map(|(_, r)| r);
    let pool = WorkerPool::new(config.workers)?;
    let store = ChunkStore::open(&args.input)
        .with_context(|| format!("failed to open input store {}", args.input.display()))?;
    info!(workers = pool.workers(), input = %args.input.display(), "starting run");

    let output = Pipeline::new(PipelineInput::Store(store), config)?.run(&pool)?;
    summarize(&output);

    if let Some(dir) = &args.grid_dir {
        write_grids(dir, &output, region.as_ref(), args.cell_size)?;
    }
    pool.shutdown();
    Ok(())
}

fn summarize(out: &PipelineOutput) {
    for c in &out.counts {
        info!(stage = c.stage, points = c.points, "count");
    }
    if let Some(t) = &out.dhdt {
        let slopes: Vec<f64> = t.param(SLOPE).into_iter().filter(|v| v.is_finite()).collect();
        let significant = t.param(P_VALUE).iter().filter(|&&p| p < 0.05).count();
        let mean = slopes.iter().sum::<f64>() / slopes.len().max(1) as f64;
        info!(
            points = t.len(),
            finite = slopes.len(),
            significant,
            mean_dhdt_m_per_yr = mean,
            from_checkpoint = out.regression_from_checkpoint,
            "dh/dt"
        );
    }
}

fn extent(x: &[f64], y: &[f64]) -> Option<Region> {
    let finite = |v: &[f64]| {
        let vals = v.iter().cloned().filter(|v| v.is_finite());
        let lo = vals.clone().fold(f64::INFINITY, f64::min);
        let hi = vals.fold(f64::NEG_INFINITY, f64::max);
        (lo <= hi).then_some((lo, hi))
    };
    let (xmin, xmax) = finite(x)?;
    let (ymin, ymax) = finite(y)?;
    Some(Region::new("data extent", xmin, xmax, ymin, ymax))
}

fn write_grid(path: &Path, grid: &Grid) -> Result<()> {
    let text = serde_json::to_string(grid).context("serializing grid")?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), width = grid.width, height = grid.height, cells = grid.filled_cells(), "grid written");
    Ok(())
}

fn write_grids(dir: &Path, out: &PipelineOutput, region: Option<&Region>, cell_size: f64) -> Result<()> {
    anyhow::ensure!(cell_size > 0.0, "--cell-size must be positive");
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    if let Some(t) = &out.height_range {
        match region.cloned().or_else(|| extent(&t.points.x, &t.points.y)) {
            Some(r) => write_grid(
                &dir.join("h_range.json"),
                &rasterize_mean(&t.points.x, &t.points.y, &t.h_range, &r, cell_size),
            )?,
            None => warn!("no located points; skipping h_range grid"),
        }
    }
    if let Some(t) = &out.dhdt {
        match region.cloned().or_else(|| extent(&t.points.x, &t.points.y)) {
            Some(r) => write_grid(
                &dir.join("dhdt_slope.json"),
                &rasterize_mean(&t.points.x, &t.points.y, &t.slope(), &r, cell_size),
            )?,
            None => warn!("no located points; skipping dh/dt grid"),
        }
    }
    Ok(())
}

fn print_regions() {
    println!("{:<12} {:<22} {:>14} {:>14} {:>14} {:>14}", "key", "name", "xmin", "xmax", "ymin", "ymax");
    for (key, r) in named_regions() {
        println!(
            "{:<12} {:<22} {:>14.1} {:>14.1} {:>14.1} {:>14.1}",
            key, r.name, r.xmin, r.xmax, r.ymin, r.ymax
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlxi_core::dataset::vars;
    use atlxi_core::{HeightRangeTable, Points};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch(tag: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "atlxi-cli-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    fn range_output(x: Vec<f64>, y: Vec<f64>) -> PipelineOutput {
        let h_range = vec![0.5; x.len()];
        PipelineOutput {
            date_range: None,
            height_range: Some(HeightRangeTable {
                points: Points {
                    ref_pt: (0..x.len() as u64).collect(),
                    x,
                    y,
                },
                h_range,
            }),
            dhdt: None,
            counts: Vec::new(),
            range_from_checkpoint: false,
            regression_from_checkpoint: false,
        }
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = scratch("cfg");
        let path = dir.join("run.json");
        fs::write(
            &path,
            r#"{"workers": 3, "range_threshold": 0.5, "region": "kamb", "checkpoint": {"mode": "off"}}"#,
        )
        .unwrap();
        let file = path.to_str().unwrap();

        let from_file = load_config(&run_args(&["atlxi", "run", "-i", "in", "-c", file])).unwrap();
        assert_eq!(from_file.workers, 3);
        assert_eq!(from_file.range_threshold, 0.5);
        assert_eq!(from_file.checkpoint.mode, CheckpointMode::Off);

        let cfg = load_config(&run_args(&[
            "atlxi",
            "run",
            "-i",
            "in",
            "-c",
            file,
            "--range-threshold",
            "0.4",
            "--region",
            "whillans",
            "--checkpoint",
            "refresh",
            "--checkpoint-dir",
            "ckpt",
        ]))
        .unwrap();
        assert_eq!(cfg.range_threshold, 0.4);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.region, Some(RegionSpec::Named("whillans".into())));
        assert_eq!(cfg.checkpoint.mode, CheckpointMode::Refresh);
        assert_eq!(cfg.checkpoint.dir, Some(PathBuf::from("ckpt")));

        let defaults = load_config(&run_args(&["atlxi", "run", "-i", "in"])).unwrap();
        assert_eq!(defaults, PipelineConfig::default());

        assert!(load_config(&run_args(&["atlxi", "run", "-i", "in", "--region", "atlantis"])).is_err());
    }

    #[test]
    fn synthetic_store_runs_end_to_end() {
        let dir = scratch("synth");
        let params = synth::SynthParams {
            points: 400,
            cycles: 6,
            chunk_points: 64,
            seed: 7,
        };
        let written = synth::write_store(&dir.join("store"), &params).unwrap();
        let store = ChunkStore::open(written.root()).unwrap();
        assert_eq!(store.manifest().n_points, 400);
        assert_eq!(store.manifest().chunks.len(), 7);
        assert_eq!(store.cycles(), &[3, 4, 5, 6, 7, 8]);
        assert_eq!(store.attr("seed"), Some("7"));

        let pool = WorkerPool::new(2).unwrap();
        let heights = store.variable(vars::H_CORR).unwrap().materialize(&pool).unwrap();
        assert!(heights.data().iter().any(|v| v.is_nan()));
        let flags = store.variable(vars::QUALITY).unwrap().materialize(&pool).unwrap();
        assert!(flags.data().contains(&1.0));

        let out = Pipeline::new(PipelineInput::Store(store), PipelineConfig::default())
            .unwrap()
            .run(&pool)
            .unwrap();
        let counts: Vec<usize> = out.counts.iter().map(|c| c.points).collect();
        assert_eq!(counts.len(), 5);
        assert_eq!(counts[0], 400);
        assert!(counts[1] < counts[0], "stage 1 dropped nothing: {counts:?}");
        // Flat points stay under the range threshold.
        assert!(counts[3] < counts[2], "threshold dropped nothing: {counts:?}");

        let dhdt = out.dhdt.unwrap();
        assert_eq!(dhdt.len(), counts[4]);
        assert!(dhdt.slope().iter().any(|s| s.is_finite() && s.abs() > 0.1));
        pool.shutdown();
    }

    #[test]
    fn extent_ignores_missing_coordinates() {
        let nan = f64::NAN;
        assert!(extent(&[nan, nan], &[nan, nan]).is_none());
        assert!(extent(&[], &[]).is_none());
        assert!(extent(&[1.0], &[nan]).is_none());
        let r = extent(&[nan, 1.0, 3.0], &[2.0, nan, -4.0]).unwrap();
        assert_eq!((r.xmin, r.xmax, r.ymin, r.ymax), (1.0, 3.0, -4.0, 2.0));
    }

    #[test]
    fn grids_fall_back_to_the_data_extent() {
        let dir = scratch("grids");
        write_grids(&dir, &range_output(vec![0.0, 1_500.0], vec![0.0, 500.0]), None, 1_000.0).unwrap();
        let text = fs::read_to_string(dir.join("h_range.json")).unwrap();
        let grid: Grid = serde_json::from_str(&text).unwrap();
        assert_eq!((grid.width, grid.height), (2, 1));
        assert_eq!(grid.filled_cells(), 2);
        assert!(!dir.join("dhdt_slope.json").exists());

        let unlocated = scratch("grids-unlocated");
        let out = range_output(vec![f64::NAN; 2], vec![f64::NAN; 2]);
        write_grids(&unlocated, &out, None, 1_000.0).unwrap();
        assert!(!unlocated.join("h_range.json").exists());
        assert!(write_grids(&unlocated, &out, None, 0.0).is_err());
    }
}
