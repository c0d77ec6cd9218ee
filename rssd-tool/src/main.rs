use anyhow::{ensure, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use ndarray::Array2;
use prettytable::{cell, row, Table};
use rssd::{anchors::GridSize, coder::LabeledBoxes, config::Config};
use std::{
    env,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Parser)]
/// Inspect anchor layouts and target assignment of a detector config.
enum Opts {
    /// Print the anchor pyramid for an input resolution.
    Anchors {
        /// configuration file
        config_file: PathBuf,
        /// input image height
        height: usize,
        /// input image width
        width: usize,
    },
    /// Match ground truth boxes against the anchors and print the counts.
    Assign {
        /// configuration file
        config_file: PathBuf,
        /// input image height
        height: usize,
        /// input image width
        width: usize,
        /// JSON5 list of frames, each a list of [x1, y1, x2, y2, label] rows
        targets_file: PathBuf,
    },
}

fn main() -> Result<()> {
    // log at info level unless RUST_LOG says otherwise
    let mut logger = pretty_env_logger::formatted_builder();
    match env::var("RUST_LOG") {
        Ok(filters) => logger.parse_filters(&filters),
        Err(_) => logger.filter_level(LevelFilter::Info),
    };
    logger.init();

    match Opts::parse() {
        Opts::Anchors {
            config_file,
            height,
            width,
        } => anchors(config_file, height, width)?,
        Opts::Assign {
            config_file,
            height,
            width,
            targets_file,
        } => assign(config_file, height, width, targets_file)?,
    }

    Ok(())
}

fn load_config(config_file: impl AsRef<Path>) -> Result<Config> {
    let config_file = config_file.as_ref();
    Config::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))
}

/// Feature map sizes of every pyramid level, rounding partial cells up.
fn pyramid_grids(config: &Config, height: usize, width: usize) -> Result<Vec<GridSize>> {
    ensure!(height > 0 && width > 0, "image size must be positive");
    let anchors = config.anchors.anchors_init().build()?;
    let grids = anchors
        .layers()
        .iter()
        .map(|layer| {
            let stride = layer.stride() as f64;
            GridSize::new(
                (height as f64 / stride).ceil() as usize,
                (width as f64 / stride).ceil() as usize,
            )
        })
        .collect();
    Ok(grids)
}

fn anchors(config_file: impl AsRef<Path>, height: usize, width: usize) -> Result<()> {
    let config = load_config(config_file)?;
    let grids = pyramid_grids(&config, height, width)?;
    let anchors = config.anchors.anchors_init().build()?;

    {
        let mut table = Table::new();
        table.add_row(row!["level", "stride", "grid", "anchors", "box sizes (w x h)"]);

        anchors
            .layers()
            .iter()
            .zip(&grids)
            .zip(&config.anchors.pyramid_levels)
            .for_each(|((layer, grid), level)| {
                let sizes = layer
                    .box_sizes()
                    .iter()
                    .map(|[w, h]| format!("{:.1}x{:.1}", w, h))
                    .collect::<Vec<_>>()
                    .join(" ");
                table.add_row(row![
                    level,
                    layer.stride(),
                    format!("{}x{}", grid.h, grid.w),
                    grid.num_cells() * layer.num_anchors(),
                    sizes,
                ]);
            });

        table.printstd();
    }

    println!("total anchors: {}", anchors.total_anchors(&grids)?);
    Ok(())
}

fn assign(
    config_file: impl AsRef<Path>,
    height: usize,
    width: usize,
    targets_file: impl AsRef<Path>,
) -> Result<()> {
    let config = load_config(config_file)?;
    let grids = pyramid_grids(&config, height, width)?;
    let mut coder = config.box_coder_init().build()?;

    let targets_file = targets_file.as_ref();
    let text = std::fs::read_to_string(targets_file)
        .with_context(|| format!("failed to read targets file '{}'", targets_file.display()))?;
    let frames: Vec<Vec<[f32; 5]>> = json5::from_str(&text)
        .with_context(|| format!("failed to parse targets file '{}'", targets_file.display()))?;
    let frames: Vec<LabeledBoxes> = frames
        .into_iter()
        .map(|rows| {
            let num_rows = rows.len();
            let flat: Vec<f32> = rows.into_iter().flatten().collect();
            LabeledBoxes::from_rows(&Array2::from_shape_vec((num_rows, 5), flat)?)
        })
        .collect::<Result<_>>()?;
    info!("loaded {} frames from '{}'", frames.len(), targets_file.display());

    let targets = coder.encode(&grids, &frames)?;

    {
        let mut table = Table::new();
        table.add_row(row!["frame", "boxes", "positive", "ignored", "background"]);

        frames
            .iter()
            .zip(targets.cls.outer_iter())
            .enumerate()
            .for_each(|(index, (gt, classes))| {
                let positive = classes.iter().filter(|&&class| class > 0).count();
                let ignored = classes.iter().filter(|&&class| class < 0).count();
                let background = classes.len() - positive - ignored;
                table.add_row(row![index, gt.len(), positive, ignored, background]);
            });

        table.printstd();
    }

    println!(
        "total: {} positive, {} ignored",
        targets.num_positive(),
        targets.num_ignored()
    );
    Ok(())
}
