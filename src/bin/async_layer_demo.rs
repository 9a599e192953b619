//! Renders a handful of layers through a re-render storm and prints the
//! resulting metrics as JSON.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_layer::canvas::Rect;
use async_layer::{
    AsyncLayer, Color, ControlLoop, DisplayTask, LayerProps, RenderConfig, RenderResult,
    RenderScheduler, Size, WorkerQueuePool,
};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

const LAYERS: usize = 6;
const STORM_ROUNDS: usize = 20;

/// Render several layers through a re-render storm and print the metrics.
#[derive(Parser, Debug)]
#[command(name = "async_layer_demo", version)]
struct Args {
    /// JSON render config; defaults plus environment overrides when absent.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Emit logs as JSON objects.
    #[arg(long)]
    json_logs: bool,

    /// Write each layer's final contents as PNG into this directory.
    #[arg(long = "save", value_name = "DIR")]
    save_dir: Option<PathBuf>,
}

#[derive(Default)]
struct Outcomes {
    finished: AtomicUsize,
    superseded: AtomicUsize,
}

/// Paints horizontal stripes, checking for cancellation between rows.
struct StripeDelegate {
    hue: u8,
    outcomes: Arc<Outcomes>,
}

impl StripeDelegate {
    fn task(&self) -> DisplayTask {
        let hue = self.hue;
        let outcomes = Arc::clone(&self.outcomes);
        DisplayTask::new()
            .on_display(move |canvas, size, check| {
                let rows = size.height.ceil() as usize;
                for row in 0..rows {
                    if check.is_cancelled() {
                        return false;
                    }
                    let shade = if row % 2 == 0 { hue } else { hue / 2 };
                    canvas.fill_rect(
                        Rect::new(0.0, row as f64, size.width, 1.0),
                        Color::rgb(shade, 255 - shade, 128),
                    );
                    std::thread::sleep(Duration::from_micros(50));
                }
                true
            })
            .on_did_display(move |_, finished| {
                let counter = if finished {
                    &outcomes.finished
                } else {
                    &outcomes.superseded
                };
                counter.fetch_add(1, Ordering::Relaxed);
            })
    }
}

impl async_layer::AsyncLayerDelegate for StripeDelegate {
    fn new_display_task(&self) -> DisplayTask {
        self.task()
    }
}

#[derive(Serialize)]
struct Report {
    queues: usize,
    layers: usize,
    finished: usize,
    superseded: usize,
    counters: std::collections::HashMap<String, u64>,
    timings: std::collections::HashMap<String, async_layer::MetricSummary>,
}

fn run(args: &Args) -> RenderResult<Report> {
    let config = match &args.config {
        Some(path) => RenderConfig::load_from_file(path)?,
        None => RenderConfig::from_env(),
    };

    let control = ControlLoop::new();
    let pool = Arc::new(WorkerQueuePool::new(&config)?);
    let scheduler = RenderScheduler::new(Arc::clone(&pool), control.handle(), &config)?;
    let outcomes = Arc::new(Outcomes::default());

    let delegates: Vec<Arc<StripeDelegate>> = (0..LAYERS)
        .map(|i| {
            Arc::new(StripeDelegate {
                hue: (i * 40) as u8,
                outcomes: Arc::clone(&outcomes),
            })
        })
        .collect();
    let layers: Vec<Arc<AsyncLayer>> = delegates
        .iter()
        .enumerate()
        .map(|(i, delegate)| {
            let side = 32.0 + 16.0 * i as f64;
            AsyncLayer::with_delegate(
                LayerProps {
                    bounds: Size::new(side, side),
                    opaque: i % 2 == 0,
                    background_color: Some(Color::rgba(0, 0, 0, 64)),
                    ..LayerProps::default()
                },
                delegate,
            )
        })
        .collect();

    // Several requests per layer per cycle, plus direct displays that
    // supersede whatever the previous cycle started.
    for round in 0..STORM_ROUNDS {
        for layer in &layers {
            for _ in 0..3 {
                scheduler.set_needs_display(layer);
            }
            if round % 5 == 0 {
                scheduler.display(layer);
            }
        }
        control.run_once(Duration::from_millis(2));
    }

    // every display call reports exactly once
    let expected = LAYERS * (STORM_ROUNDS + STORM_ROUNDS.div_ceil(5));
    let settled = control.run_until(
        || {
            let done = outcomes.finished.load(Ordering::Relaxed)
                + outcomes.superseded.load(Ordering::Relaxed);
            done >= expected
                && layers.iter().all(|l| l.phase() == async_layer::RenderPhase::Idle)
        },
        Duration::from_secs(10),
    );
    control.exit();
    info!(settled, "storm finished");

    if let Some(dir) = &args.save_dir {
        save_images(dir, &layers);
    }

    let metrics = scheduler.metrics();
    Ok(Report {
        queues: pool.len(),
        layers: LAYERS,
        finished: outcomes.finished.load(Ordering::Relaxed),
        superseded: outcomes.superseded.load(Ordering::Relaxed),
        counters: metrics.counters(),
        timings: metrics.summary(),
    })
}

fn save_images(dir: &Path, layers: &[Arc<AsyncLayer>]) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        error!(dir = %dir.display(), error = %e, "cannot create output directory");
        return;
    }
    for layer in layers {
        let Some(image) = layer.contents() else {
            continue;
        };
        let path = dir.join(format!("{}.png", layer.id()));
        match image.as_rgba().save(&path) {
            Ok(()) => info!(path = %path.display(), "layer image saved"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to save layer image"),
        }
    }
}

fn main() {
    let args = Args::parse();
    if args.json_logs {
        async_layer::init_json_tracing();
    } else {
        async_layer::init_tracing();
    }

    match run(&args) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!(error = %e, "failed to serialize report");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %e, "demo failed");
            std::process::exit(1);
        }
    }
}
