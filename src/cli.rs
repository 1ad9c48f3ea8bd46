use std::path::PathBuf;

use clap::{Parser, Subcommand};
use image::imageops::FilterType;
use tracing::info;

use srcnn_gpu::cnn::config::Config;
use srcnn_gpu::cnn::trainer::SrcnnPipeline;
use srcnn_gpu::error::{Result, SrcnnError};
use srcnn_gpu::gpu::open_default_backend;

#[derive(Parser)]
#[command(name = "srcnn")]
#[command(about = "3-layer super-resolution CNN on a GPU compute backend", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    Train {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Low-resolution training image; derived from the ground truth by
        /// downscale + bicubic upscale when omitted.
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        truth: PathBuf,
        #[arg(long, default_value = "100")]
        steps: usize,
        #[arg(long, default_value = "2.0")]
        scale: f32,
        #[arg(long)]
        save: Option<PathBuf>,
    },
    Upscale {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "2.0")]
        scale: f32,
    },
    Info {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    #[command(name = "usage")]
    Usage,
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p),
        None => Ok(Config::default()),
    }
}

fn load_rgba(path: &PathBuf) -> Result<(Vec<u8>, usize, usize)> {
    let img = image::open(path)
        .map_err(|e| SrcnnError::Config(format!("{}: {e}", path.display())))?
        .to_rgba8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    Ok((img.into_raw(), w, h))
}

#[allow(clippy::too_many_arguments)]
pub fn handle_train(
    config: &Option<PathBuf>,
    input: &Option<PathBuf>,
    truth: &PathBuf,
    steps: usize,
    scale: f32,
    save: &Option<PathBuf>,
) -> Result<()> {
    if scale <= 1.0 {
        return Err(SrcnnError::Config(format!("scale {scale} must exceed 1")));
    }
    let mut cfg = load_config(config)?;
    if let Some(path) = save {
        cfg.parameters_file = Some(path.clone());
    }

    let (truth_rgba, w, h) = load_rgba(truth)?;
    let input_rgba = match input {
        Some(path) => {
            let (rgba, iw, ih) = load_rgba(path)?;
            if (iw, ih) != (w, h) {
                return Err(SrcnnError::SizeMismatch(format!(
                    "input {iw}x{ih} and ground truth {w}x{h} differ"
                )));
            }
            rgba
        }
        // Standard training pair: degrade the ground truth, then bicubic
        // back to full size so extents match.
        None => {
            let truth_img = image::RgbaImage::from_raw(w as u32, h as u32, truth_rgba.clone())
                .unwrap_or_else(|| unreachable!("buffer sized from extent"));
            let small_w = ((w as f32 / scale).round() as u32).max(1);
            let small_h = ((h as f32 / scale).round() as u32).max(1);
            let small =
                image::imageops::resize(&truth_img, small_w, small_h, FilterType::CatmullRom);
            image::imageops::resize(&small, w as u32, h as u32, FilterType::CatmullRom).into_raw()
        }
    };

    let backend = open_default_backend()?;
    let mut pipeline = SrcnnPipeline::new(backend, cfg, w, h)?;
    for step in 0..steps {
        let mse = pipeline.train_step(&input_rgba, &truth_rgba)?;
        info!(step, mse, "trained");
    }
    if pipeline.config().parameters_file.is_some() {
        pipeline.dump_parameters()?;
    }
    Ok(())
}

pub fn handle_upscale(
    config: &Option<PathBuf>,
    input: &PathBuf,
    output: &PathBuf,
    scale: f32,
) -> Result<()> {
    if scale <= 0.0 {
        return Err(SrcnnError::Config(format!("scale {scale} must be positive")));
    }
    let cfg = load_config(config)?;

    let img = image::open(input)
        .map_err(|e| SrcnnError::Config(format!("{}: {e}", input.display())))?;
    let up_w = (img.width() as f32 * scale).round() as u32;
    let up_h = (img.height() as f32 * scale).round() as u32;
    // The network refines an already-interpolated image.
    let upscaled = image::imageops::resize(&img.to_rgba8(), up_w, up_h, FilterType::CatmullRom);
    let (w, h) = (up_w as usize, up_h as usize);

    let backend = open_default_backend()?;
    let mut pipeline = SrcnnPipeline::new(backend, cfg, w, h)?;
    let (luma, out_w, out_h) = pipeline.reconstruct(upscaled.as_raw(), w, h)?;

    let pixels: Vec<u8> = luma
        .iter()
        .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect();
    let gray = image::GrayImage::from_raw(out_w as u32, out_h as u32, pixels)
        .unwrap_or_else(|| unreachable!("buffer sized from extent"));
    gray.save(output)
        .map_err(|e| SrcnnError::Config(format!("{}: {e}", output.display())))?;
    info!(out_w, out_h, path = %output.display(), "reconstruction written");
    Ok(())
}

pub fn handle_info(config: &Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config)?;
    let layers = cfg.build_layers()?;
    println!("Network: 1 -> {} -> {} -> 1 filters", cfg.n1, cfg.n2);
    println!("Filters: {}x{}, {}x{}, {}x{}", cfg.f1, cfg.f1, cfg.f2, cfg.f2, cfg.f3, cfg.f3);
    println!("Total padding: {} pixels", cfg.total_padding());
    for (i, layer) in layers.iter().enumerate() {
        println!(
            "Layer {}: {} weights, {} bias values",
            i + 1,
            layer.weight_size(),
            layer.bias_size()
        );
    }
    println!("Momentum: {}", cfg.momentum);
    println!("Weight decay: {}", cfg.weight_decay);
    println!(
        "Learning rates: {}, {}, {}",
        cfg.learning_rate[0], cfg.learning_rate[1], cfg.learning_rate[2]
    );
    match &cfg.parameters_file {
        Some(p) => println!("Parameters file: {}", p.display()),
        None => println!("Parameters file: none (seeded random parameters)"),
    }
    Ok(())
}

pub fn print_help() {
    println!("Commands:");
    println!("  train    Train the network on an input/ground-truth image pair");
    println!("  upscale  Interpolate an image and refine it through the network");
    println!("  info     Display network dimensions for a configuration");
    println!("  usage    Show this help message\n");
    println!("Train Options:");
    println!("  --config=FILE.json     Configuration file (default: built-in sizing)");
    println!("  --truth=FILE           Ground-truth image (required)");
    println!("  --input=FILE           Low-resolution image, same extent; derived");
    println!("                         from the ground truth when omitted");
    println!("  --steps=N              Training steps (default: 100)");
    println!("  --scale=VALUE          Degradation factor for derived inputs (default: 2.0)");
    println!("  --save=FILE            Write parameters here after training\n");
    println!("Upscale Options:");
    println!("  --config=FILE.json     Configuration file (default: built-in sizing)");
    println!("  --input=FILE           Image to upscale (required)");
    println!("  --output=FILE          Output image path (required)");
    println!("  --scale=VALUE          Interpolation factor (default: 2.0)\n");
    println!("Info Options:");
    println!("  --config=FILE.json     Configuration file (default: built-in sizing)");
}
