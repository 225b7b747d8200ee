use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facelock_core::{
    templates, EmbeddingEngine, FaceDetector, FaceLocator, OnnxEmbedder, ScrfdDetector,
};
use facelock_hw::capture::max_area_size;
use facelock_hw::{list_devices, CameraBackend, V4l2Backend};
use std::io::BufWriter;
use std::path::PathBuf;

mod embed;

// `#[zbus::proxy]` generates `FaceLockProxy` (async) and `FaceLockProxyBlocking`.
#[zbus::proxy(
    interface = "org.facelock.FaceLock1",
    default_service = "org.facelock.FaceLock1",
    default_path = "/org/facelock/FaceLock1"
)]
trait FaceLock {
    async fn authenticate(&self) -> zbus::Result<(bool, f64)>;
    async fn cancel(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_engine(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facelock", about = "FaceLock face-unlock CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a frame and check it against the enrolled templates
    Authenticate,
    /// Cancel the running authentication attempt
    Cancel,
    /// Show daemon status
    Status,
    /// Reload the embedding model and templates in the daemon
    Reload,
    /// Compute embeddings for face images and write them as CSV templates
    Embed {
        /// Output CSV file
        #[arg(short, long, default_value = "embeddings.csv")]
        output: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long, default_value = "/usr/share/facelock/models")]
        model_dir: PathBuf,
        /// FaceNet model file name
        #[arg(long, default_value = "facenet.onnx")]
        embedding_model: String,
        /// SCRFD model file name
        #[arg(long, default_value = "det_10g.onnx")]
        detector_model: String,
        /// Images are already face crops; skip detection
        #[arg(long)]
        crops: bool,
        /// Input images (JPEG or PNG)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List V4L2 cameras and their largest MJPEG resolution
    Cameras,
}

async fn proxy(session: bool) -> Result<FaceLockProxy<'static>> {
    let connection = if session {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    FaceLockProxy::new(&connection)
        .await
        .context("connecting to facelockd")
}

fn run_embed(
    output: PathBuf,
    model_dir: PathBuf,
    embedding_model: String,
    detector_model: String,
    crops: bool,
    images: Vec<PathBuf>,
) -> Result<()> {
    let model_path = model_dir.join(embedding_model);
    let model = OnnxEmbedder::load(&model_path.to_string_lossy(), 1)
        .with_context(|| format!("loading {}", model_path.display()))?;
    let engine = EmbeddingEngine::new(Box::new(model));

    let mut locator = if crops {
        None
    } else {
        let path = model_dir.join(detector_model);
        let detector = ScrfdDetector::load(&path.to_string_lossy(), 1)
            .with_context(|| format!("loading {}", path.display()))?;
        Some(FaceLocator::new(Box::new(detector) as Box<dyn FaceDetector>))
    };

    let mut embeddings = Vec::with_capacity(images.len());
    for image in &images {
        embeddings.push(embed::embed_image(image, locator.as_mut(), &engine)?);
        println!("  {}", image.display());
    }

    let file = std::fs::File::create(&output)
        .with_context(|| format!("creating {}", output.display()))?;
    templates::write_csv(BufWriter::new(file), &embeddings)?;
    engine.shutdown();

    println!("Wrote {} embedding(s) to {}", embeddings.len(), output.display());
    Ok(())
}

fn run_cameras() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }

    let mut backend = V4l2Backend::new(Vec::new(), 0);
    for device in devices {
        let max = backend
            .characteristics(&device.path)
            .ok()
            .and_then(|c| max_area_size(&c.output_sizes));
        match max {
            Some(size) => println!(
                "{}  {} ({}, {})  MJPEG up to {}x{}",
                device.path, device.name, device.driver, device.bus, size.width, size.height
            ),
            None => println!(
                "{}  {} ({}, {})  no MJPEG output",
                device.path, device.name, device.driver, device.bus
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Authenticate => {
            println!("Look at the camera...");
            let (matched, score) = proxy(cli.session).await?.authenticate().await?;
            if matched {
                println!("Match (distance {score:.4})");
            } else {
                println!("No match (closest distance {score:.4})");
                std::process::exit(1);
            }
        }
        Commands::Cancel => {
            if proxy(cli.session).await?.cancel().await? {
                println!("Attempt cancelled");
            } else {
                println!("No attempt running");
            }
        }
        Commands::Status => {
            let raw = proxy(cli.session).await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Reload => {
            proxy(cli.session).await?.reload_engine().await?;
            println!("Engine and templates reloaded");
        }
        Commands::Embed {
            output,
            model_dir,
            embedding_model,
            detector_model,
            crops,
            images,
        } => {
            tokio::task::spawn_blocking(move || {
                run_embed(output, model_dir, embedding_model, detector_model, crops, images)
            })
            .await??;
        }
        Commands::Cameras => run_cameras(),
    }

    Ok(())
}
