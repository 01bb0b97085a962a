use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facevote", about = "Voter face enrollment and verification CLI")]
struct Cli {
    /// Talk to facevoted on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a voter from single-face photos
    Enroll {
        /// Voter name, unique within the gallery
        #[arg(short, long)]
        label: String,
        /// Enrollment photos (the daemon decides how many it needs)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify every face in a photo
    Verify {
        image: PathBuf,
    },
    /// List enrolled voters
    List,
    /// Remove an enrolled voter
    Remove {
        /// Record ID to remove
        id: String,
    },
    /// Change a voter's label or note
    Update {
        id: String,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(short, long)]
        note: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.facevote.Gallery1",
    default_service = "org.facevote.Gallery1",
    default_path = "/org/facevote/Gallery1"
)]
trait Gallery {
    async fn enroll(&self, label: &str, images: &[Vec<u8>]) -> zbus::Result<String>;
    async fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn list_voters(&self) -> zbus::Result<String>;
    async fn remove_voter(&self, id: &str) -> zbus::Result<bool>;
    async fn update_voter(&self, id: &str, label: &str, note: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = GalleryProxy::new(&conn)
        .await
        .context("facevoted is not reachable")?;

    match cli.command {
        Commands::Enroll { label, images } => {
            let images = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(label = %label, images = images.len(), "sending enrollment");
            let id = proxy.enroll(&label, &images).await?;
            print_json(&serde_json::json!({ "id": id, "label": label }).to_string())?;
        }
        Commands::Verify { image } => {
            let image = read_image(&image)?;
            print_json(&proxy.verify(&image).await?)?;
        }
        Commands::List => {
            print_json(&proxy.list_voters().await?)?;
        }
        Commands::Remove { id } => {
            let removed = proxy.remove_voter(&id).await?;
            print_json(&serde_json::json!({ "id": id, "removed": removed }).to_string())?;
        }
        Commands::Update { id, label, note } => {
            if label.is_none() && note.is_none() {
                anyhow::bail!("nothing to update; pass --label and/or --note");
            }
            let record = proxy
                .update_voter(
                    &id,
                    label.as_deref().unwrap_or(""),
                    note.as_deref().unwrap_or(""),
                )
                .await?;
            print_json(&record)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
