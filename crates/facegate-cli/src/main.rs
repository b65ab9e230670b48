use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::ledger::ResourceKind;
use facegate_core::{pipeline, AnalysisParams, ColorSpace, ImageHandle, RecognitionEngine, SearchParams};
use facegated::config::Config;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "Face verification, analysis and gallery search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the most prominent face in two images
    Verify { image_a: PathBuf, image_b: PathBuf },
    /// Detect faces and report their attributes
    Analyze {
        image: PathBuf,
        /// False detection rate, in (0, 1]
        #[arg(long)]
        fdr: Option<String>,
        /// Smallest face width to report, in pixels
        #[arg(long)]
        min_face_width: Option<String>,
        /// Number of faces to detect
        #[arg(long)]
        faces: Option<String>,
    },
    /// Enroll every face in a gallery image and rank it against a probe face
    Search {
        gallery: PathBuf,
        probe: PathBuf,
        /// Faces to enroll from the gallery image
        #[arg(long)]
        max_faces: Option<String>,
        /// Candidates to return
        #[arg(long)]
        candidates: Option<String>,
    },
    /// Serialize the face template of an image and check it restores intact
    Flatten {
        image: PathBuf,
        /// Write the serialized template here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode as BGR24, convert to RGBA and back, and check nothing changed
    Convert {
        image: PathBuf,
        /// Save the RGBA copy as PNG here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the HTTP service
    Serve { port: u16 },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    if let Commands::Serve { port } = cli.command {
        config.port = port;
        facegated::serve(config).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut engine = facegated::build_engine(&config)?;
    let outcome = run_offline(engine.as_mut(), cli.command, &config);
    if let Err(err) = engine.finalize() {
        tracing::warn!(error = %err, "engine finalize failed");
    }
    outcome
}

/// Run one pipeline in-process and print its result.
fn run_offline(engine: &mut dyn RecognitionEngine, command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Verify { image_a, image_b } => {
            let result = pipeline::verify(engine, [image_a.as_path(), image_b.as_path()])?;
            print_json(&result)?;
            if !result.is_compared() {
                return Ok(ExitCode::FAILURE);
            }
            let verdict = if result.is_match(config.match_threshold) {
                "match"
            } else {
                "no match"
            };
            eprintln!("{verdict} (threshold {:.2})", config.match_threshold);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Analyze {
            image,
            fdr,
            min_face_width,
            faces,
        } => {
            let params = AnalysisParams::from_query(fdr.as_deref(), min_face_width.as_deref(), faces.as_deref())?;
            let result = pipeline::analyze(engine, &image, &params)?;
            print_json(&result)?;
            Ok(exit_for(result.code.is_none()))
        }
        Commands::Search {
            gallery,
            probe,
            max_faces,
            candidates,
        } => {
            let params = SearchParams::from_query(max_faces.as_deref(), candidates.as_deref())?;
            let result = pipeline::search(engine, &gallery, &probe, &params)?;
            print_json(&result)?;
            Ok(exit_for(result.code.is_none()))
        }
        Commands::Flatten { image, output } => {
            let result = pipeline::flatten(engine, &image)?;
            print_json(&result)?;
            if let (None, Some(path)) = (&result.code, output) {
                std::fs::write(&path, &result.bytes)
                    .with_context(|| format!("writing template to {}", path.display()))?;
                tracing::info!(path = %path.display(), size = result.size, "template written");
            }
            Ok(exit_for(result.code.is_none()))
        }
        Commands::Convert { image, output } => {
            let report = convert(engine, &image, output.as_deref())?;
            print_json(&report)?;
            Ok(exit_for(report.round_trip))
        }
        Commands::Serve { .. } => anyhow::bail!("serve does not run a pipeline"),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversionReport {
    width: u32,
    height: u32,
    round_trip: bool,
}

/// BGR24 → RGBA → BGR24, optionally saving the RGBA copy.
fn convert(engine: &mut dyn RecognitionEngine, image: &Path, output: Option<&Path>) -> Result<ConversionReport> {
    let bgr = engine.read_image(image, ColorSpace::Bgr24)?;
    let rgba = bgr.to_rgba();
    let back = ImageHandle::from_rgba(&rgba, engine.ledger().issue(ResourceKind::Image));
    if let Some(path) = output {
        rgba.save(path).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "rgba copy written");
    }
    Ok(ConversionReport {
        width: bgr.width(),
        height: bgr.height(),
        round_trip: back.data() == bgr.data(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
