// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use clap::Parser;
use indicatif::ProgressStyle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use waveview::*;

#[derive(Parser, Debug)]
#[command(name = "render_trace")]
#[command(author = "Kevin Laeufer <laeufer@berkeley.edu>")]
#[command(version)]
#[command(about = "Loads a VCD file and prints its signals as ASCII waveforms.", long_about = None)]
struct Args {
    #[arg(value_name = "VCDFILE", index = 1)]
    filename: String,
    /// Signals to print, all signals if none are given.
    #[arg(long = "signal", short = 's')]
    signals: Vec<String>,
    #[arg(long, default_value_t = 100)]
    columns: usize,
    #[arg(long)]
    start: Option<f64>,
    #[arg(long)]
    end: Option<f64>,
    #[arg(long, value_parser = parse_format, default_value = "hex")]
    format: BusFormat,
    #[arg(long)]
    config: Option<String>,
}

fn parse_format(value: &str) -> std::result::Result<BusFormat, String> {
    match value {
        "bin" | "binary" => Ok(BusFormat::Binary),
        "hex" => Ok(BusFormat::Hexadecimal),
        "oct" => Ok(BusFormat::Octal),
        "dec" | "unsigned" => Ok(BusFormat::Unsigned),
        "signed" => Ok(BusFormat::Signed),
        other => Err(format!("unknown format `{other}`")),
    }
}

fn load_with_progress(filename: &str, options: &LoadOptions) -> waveview::Result<Trace> {
    let total = std::fs::metadata(filename)?.len();
    let progress = ProgressCount::default();
    let done = Arc::new(AtomicBool::new(false));
    let bar_thread = {
        let progress = progress.clone();
        let done = done.clone();
        thread::spawn(move || {
            let bar = indicatif::ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] {bar:40.cyan/blue} {decimal_bytes} ({percent_precise}%)",
                )
                .unwrap(),
            );
            while !done.load(Ordering::SeqCst) {
                bar.set_position(progress.load(Ordering::SeqCst));
                thread::sleep(std::time::Duration::from_millis(10));
            }
            bar.finish_and_clear();
        })
    };
    let trace = waveview::vcd::load_file(filename, options, None, Some(progress));
    done.store(true, Ordering::SeqCst);
    bar_thread.join().unwrap();
    trace
}

/// One character per column, bus labels are written over their run.
fn draw_row(row: &SignalSegments, columns: usize) -> String {
    let mut line = vec![' '; columns];
    let clamp = |x: f64| (x.max(0.0).round() as usize).min(columns);
    for segment in row.segments.iter() {
        match segment {
            Segment::Run { value, x0, x1, .. } => {
                let c = if value.width() > 1 {
                    '='
                } else {
                    match value.bits()[0] {
                        b'0' => '_',
                        b'1' => '^',
                        b'z' => '~',
                        _ => 'x',
                    }
                };
                line[clamp(*x0)..clamp(*x1)].fill(c);
            }
            Segment::Edge { x, .. } => {
                let x = clamp(*x);
                if x < columns {
                    line[x] = '|';
                }
            }
            Segment::BusLabel { text, x0, x1, .. } => {
                let start = clamp(*x0) + 1;
                let end = clamp(*x1);
                for (pos, c) in (start..end).zip(text.chars()) {
                    line[pos] = c;
                }
            }
        }
    }
    line.into_iter().collect()
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).expect("failed to load config"),
        None => EngineConfig::default(),
    };

    let start = std::time::Instant::now();
    let trace = load_with_progress(&args.filename, &config.load).expect("failed to load trace");
    println!(
        "It took {:?} to load {} ({} signals, {} bytes in memory)",
        start.elapsed(),
        args.filename,
        trace.signals().len(),
        trace.size_in_memory()
    );
    if trace.is_partial() {
        println!("WARN: the trace was cut short");
    }
    for warning in trace.warnings() {
        println!("WARN: {warning}");
    }

    let signals: Vec<SignalRef> = if args.signals.is_empty() {
        trace.signal_table().refs().collect()
    } else {
        args.signals
            .iter()
            .map(|name| {
                trace
                    .signal_by_path(name)
                    .unwrap_or_else(|| panic!("unknown signal `{name}`"))
            })
            .collect()
    };

    let mut viewport = ViewportController::new(&ViewportConfig {
        pixel_width: args.columns as f64,
        ..config.viewport.clone()
    });
    viewport.reset(trace.end_time());
    let start = args.start.unwrap_or(0.0);
    let end = args.end.unwrap_or(trace.end_time() as f64);
    if end > start {
        let span = viewport.viewport().span();
        viewport.zoom(span / (end - start), start);
        viewport.pan(viewport.viewport().pixel_of(start));
    }

    let mut options = RenderOptions::from_config(&config.render);
    options.default_format = args.format;
    let rows = render(&trace, &signals, viewport.viewport(), &options);
    let name_width = signals
        .iter()
        .map(|s| trace.signal(*s).map(|s| s.path().len()).unwrap_or(0))
        .max()
        .unwrap_or(0);
    let vp = viewport.viewport();
    println!("{:name_width$} {} .. {}", "", vp.start(), vp.end());
    for row in rows.iter() {
        let name = trace.signal(row.signal).map(|s| s.path()).unwrap_or("?");
        println!("{name:name_width$} {}", draw_row(row, args.columns));
    }
}
