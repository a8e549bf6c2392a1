use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use clap::{Parser, Subcommand};
use presence_core::{enroll, ArcFaceEmbedder, DetectionConfig, Gallery, IdentityId, ScrfdDetector};
use presence_hw::{Camera, Clahe};
use presence_store::Store;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    fn status(&self) -> zbus::Result<String>;
    fn stop(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Attendance database (default: $PRESENCE_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enrolled gallery (default: $PRESENCE_GALLERY_PATH or gallery.json in the model dir)
    #[arg(long, global = true)]
    gallery: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled identities
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    /// Capture a face and add it to the gallery under a registered identity
    Enroll {
        id: u32,
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture; the clearest face among them is enrolled
        #[arg(long, default_value_t = 5)]
        frames: usize,
        /// Free-form tag for this template (e.g. "glasses")
        #[arg(long, default_value = "default")]
        label: String,
    },
    /// Manage gallery templates
    Templates {
        #[command(subcommand)]
        command: TemplateCommand,
    },
    /// Show attendance for today or a given day
    Today {
        /// Day to show (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// List days that have attendance entries
    Days,
    /// Show daemon status
    Status,
    /// Stop the running attendance session
    Stop,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Register a person under the id used in the enrolled gallery
    Add { id: u32, name: String },
    /// List registered identities
    List,
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Template count per enrolled identity
    List,
    /// Remove every template of an identity
    Remove { id: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .or_else(|| std::env::var_os("PRESENCE_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(presence_store::default_db_path);
    let open_store = || {
        tracing::debug!(path = %db_path.display(), "opening attendance database");
        Store::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))
    };
    let model_dir = std::env::var_os("PRESENCE_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(presence_core::default_model_dir);
    let gallery_path = cli
        .gallery
        .or_else(|| std::env::var_os("PRESENCE_GALLERY_PATH").map(PathBuf::from))
        .unwrap_or_else(|| model_dir.join("gallery.json"));

    match cli.command {
        Commands::Identity { command } => match command {
            IdentityCommand::Add { id, name } => {
                let record = open_store()?.add_identity(IdentityId(id), &name)?;
                tracing::info!(id = %record.id, name = %record.name, "identity registered");
                println!("Added identity {}: {}", record.id, record.name);
            }
            IdentityCommand::List => {
                let records = open_store()?.list_identities()?;
                if records.is_empty() {
                    println!("No identities registered");
                }
                for record in records {
                    println!("{:>6}  {}", record.id.0, record.name);
                }
            }
        },
        Commands::Enroll { id, device, frames, label } => {
            let store = open_store()?;
            enroll_face(&store, &model_dir, &gallery_path, IdentityId(id), &device, frames, &label)?;
        }
        Commands::Templates { command } => match command {
            TemplateCommand::List => {
                let gallery = Gallery::open_or_new(&gallery_path)
                    .with_context(|| format!("failed to read {}", gallery_path.display()))?;
                let counts = gallery.counts();
                if counts.is_empty() {
                    println!("No templates in {}", gallery_path.display());
                }
                let directory = open_store()?.load_directory()?;
                for (id, count) in counts {
                    let name = directory.name(id).unwrap_or("(not registered)");
                    println!("{:>6}  {:<24} {count} template(s)", id.0, name);
                }
            }
            TemplateCommand::Remove { id } => {
                let mut gallery = Gallery::open_or_new(&gallery_path)
                    .with_context(|| format!("failed to read {}", gallery_path.display()))?;
                let removed = gallery.remove_identity(IdentityId(id));
                if removed == 0 {
                    bail!("identity {id} has no templates in {}", gallery_path.display());
                }
                gallery.save(&gallery_path)?;
                tracing::info!(id, removed, "templates removed");
                println!("Removed {removed} template(s) for identity {id}; restart presenced to apply");
            }
        },
        Commands::Today { date, json } => {
            let day = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let entries = open_store()?.entries_for_day(day)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No attendance recorded on {day}");
            } else {
                println!("Attendance for {day}:");
                for entry in entries {
                    println!("{:>6}  {:<24} {}", entry.identity.0, entry.name, entry.time);
                }
            }
        }
        Commands::Days => {
            for day in open_store()?.recorded_days()? {
                println!("{day}");
            }
        }
        Commands::Status => {
            let proxy = daemon_proxy().await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Stop => {
            let proxy = daemon_proxy().await?;
            if proxy.stop().await? {
                println!("Stop requested; the session ends after the current frame");
            } else {
                println!("Session is already stopping");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test { device, frames } => camera_test(&device, frames)?,
    }

    Ok(())
}

async fn daemon_proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("presenced is not running")
}

fn enroll_face(
    store: &Store,
    model_dir: &Path,
    gallery_path: &Path,
    id: IdentityId,
    device: &str,
    count: usize,
    label: &str,
) -> Result<()> {
    if count == 0 {
        bail!("--frames must be at least 1");
    }
    let directory = store.load_directory()?;
    let Some(name) = directory.name(id) else {
        bail!("identity {id} is not registered; run `presence identity add {id} <name>` first");
    };
    // Fail on an incompatible gallery before touching the camera.
    let mut gallery = Gallery::open_or_new(gallery_path)
        .with_context(|| format!("failed to read {}", gallery_path.display()))?;

    let model = |file: &str| model_dir.join(file).to_string_lossy().into_owned();
    let mut detector = ScrfdDetector::load(&model("det_10g.onnx"), DetectionConfig::default())?;
    let mut embedder = ArcFaceEmbedder::load(&model("w600k_r50.onnx"))?;

    println!("Look at the camera, {name}...");
    let camera = Camera::open(device, 640, 480)?;
    let (frames, dark) = camera.capture_frames(count, Some(Clahe::default()))?;
    tracing::info!(device, captured = frames.len(), dark, "enroll: frames captured");
    let frames: Vec<presence_core::Frame> = frames.into_iter().map(to_core_frame).collect();

    let Some((index, face)) = enroll::best_face(&mut detector, &frames)? else {
        bail!("no face detected in {} frame(s); check lighting and distance", frames.len());
    };
    let frame = &frames[index];
    let embedding = embedder.embed(frame, &face)?;
    gallery.add(enroll::template(id, label, embedding, frame.captured_at));
    gallery.save(gallery_path)?;

    let total = gallery.counts().get(&id).copied().unwrap_or(0);
    tracing::info!(%id, confidence = face.confidence, templates = total, "enrolled face");
    println!(
        "Enrolled {name} ({id}): detection confidence {:.2}, {total} template(s); restart presenced to apply",
        face.confidence
    );
    Ok(())
}

fn to_core_frame(frame: presence_hw::Frame) -> presence_core::Frame {
    presence_core::Frame {
        data: frame.data,
        width: frame.width,
        height: frame.height,
        sequence: frame.sequence,
        captured_at: DateTime::<Local>::from(frame.captured_at).naive_local(),
    }
}

fn camera_test(device: &str, count: usize) -> Result<()> {
    if count == 0 {
        bail!("--frames must be at least 1");
    }
    println!("Running camera diagnostics on {device}...");
    let camera = Camera::open(device, 640, 480)?;
    println!(
        "  format: {:?} {}x{} ({:?})",
        camera.pixel_format(),
        camera.width,
        camera.height,
        camera.fourcc
    );

    let (frames, dark) = camera.capture_frames(count, Some(Clahe::default()))?;
    tracing::debug!(device, captured = frames.len(), dark, "camera test capture finished");
    println!("  captured {} usable frames, {dark} dark", frames.len());
    for frame in &frames {
        println!("  seq {:>5}  brightness {:>6.1}", frame.sequence, frame.avg_brightness());
    }
    if frames.is_empty() {
        bail!("camera produced only dark frames; check lighting or lens cover");
    }
    Ok(())
}
