use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.tatami.Kiosk1",
    default_service = "org.tatami.Kiosk1",
    default_path = "/org/tatami/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn members(&self) -> zbus::Result<String>;
    async fn embeddings(&self) -> zbus::Result<String>;
    async fn enroll(&self, details: &str) -> zbus::Result<String>;
    async fn update_embedding(&self, member_id: &str, descriptor: &str) -> zbus::Result<String>;
    async fn match_faces(&self, faces: &str) -> zbus::Result<String>;
    async fn check_in(&self, member_id: &str) -> zbus::Result<String>;
    async fn remove_member(&self, member_id: &str) -> zbus::Result<bool>;
    async fn set_status(&self, member_id: &str, status: &str) -> zbus::Result<bool>;
    async fn set_rank(&self, member_id: &str, belt: &str, stripes: u8) -> zbus::Result<bool>;
    async fn profile_image(&self, member_id: &str) -> zbus::Result<Vec<u8>>;
    async fn attendance(&self, member_id: &str) -> zbus::Result<String>;
    async fn add_class(&self, class: &str) -> zbus::Result<String>;
    async fn classes(&self) -> zbus::Result<String>;
    async fn start_session(&self) -> zbus::Result<bool>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn faces(&self) -> zbus::Result<String>;
    async fn enroll_face(&self, index: u32, details: &str) -> zbus::Result<String>;
    async fn refresh_gallery(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "tatami", about = "Tatami gym kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Details {
    #[arg(long)]
    first_name: String,
    #[arg(long, default_value = "")]
    last_name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    /// white, blue, purple, brown or black
    #[arg(long, default_value = "white")]
    belt: String,
    #[arg(long, default_value_t = 0)]
    stripes: u8,
}

impl Details {
    fn to_json(&self, descriptor: Option<serde_json::Value>) -> String {
        serde_json::json!({
            "first_name": self.first_name,
            "last_name": self.last_name,
            "email": self.email,
            "phone": self.phone,
            "belt_rank": self.belt,
            "stripes": self.stripes,
            "descriptor": descriptor,
        })
        .to_string()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List members
    Members,
    /// Dump stored embeddings
    Embeddings,
    /// Enroll a new member
    Enroll {
        #[command(flatten)]
        details: Details,
        /// Initial face descriptor as a JSON array
        #[arg(long)]
        descriptor: Option<String>,
    },
    /// Fold an observed descriptor (JSON array) into a member's embedding
    UpdateEmbedding { member_id: String, descriptor: String },
    /// Match detected faces (JSON list) against enrolled members
    Match { faces: String },
    /// Check a member in
    CheckIn { member_id: String },
    /// Remove a member and their history
    Remove { member_id: String },
    /// Change a member's status
    SetStatus { member_id: String, status: String },
    /// Set a member's belt and stripes
    SetRank {
        member_id: String,
        belt: String,
        #[arg(default_value_t = 0)]
        stripes: u8,
    },
    /// Save a member's profile photo as PNG
    ProfileImage {
        member_id: String,
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Show a member's attendance
    Attendance { member_id: String },
    /// Add a weekly class
    AddClass {
        #[arg(long)]
        name: String,
        /// 0 = Sunday
        #[arg(long)]
        day: u8,
        /// HH:MM
        #[arg(long)]
        start: String,
        #[arg(long)]
        duration: Option<u32>,
    },
    /// Show the timetable
    Classes,
    /// Control the kiosk capture session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    Start,
    Stop,
    /// Faces in the latest frame
    Faces,
    /// Enroll the unknown face at INDEX
    EnrollFace {
        index: u32,
        #[command(flatten)]
        details: Details,
    },
    /// Reload enrolled embeddings
    RefreshGallery,
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn parse_json(what: &str, s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).with_context(|| format!("{what} is not valid JSON"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    let conn = conn.context("connecting to D-Bus")?;
    let proxy = KioskProxy::new(&conn)
        .await
        .context("tatamid is not reachable")?;
    tracing::debug!("connected to tatamid");

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Members => print_json(&proxy.members().await?)?,
        Commands::Embeddings => print_json(&proxy.embeddings().await?)?,
        Commands::Enroll {
            details,
            descriptor,
        } => {
            let descriptor = descriptor
                .map(|d| parse_json("descriptor", &d))
                .transpose()?;
            let id = proxy.enroll(&details.to_json(descriptor)).await?;
            println!("Enrolled member {id}");
        }
        Commands::UpdateEmbedding {
            member_id,
            descriptor,
        } => {
            parse_json("descriptor", &descriptor)?;
            let outcome = proxy.update_embedding(&member_id, &descriptor).await?;
            println!("Embedding {outcome} for {member_id}");
        }
        Commands::Match { faces } => {
            parse_json("faces", &faces)?;
            print_json(&proxy.match_faces(&faces).await?)?;
        }
        Commands::CheckIn { member_id } => print_json(&proxy.check_in(&member_id).await?)?,
        Commands::Remove { member_id } => {
            proxy.remove_member(&member_id).await?;
            println!("Removed member {member_id}");
        }
        Commands::SetStatus { member_id, status } => {
            proxy.set_status(&member_id, &status).await?;
            println!("Member {member_id} is now {status}");
        }
        Commands::SetRank {
            member_id,
            belt,
            stripes,
        } => {
            proxy.set_rank(&member_id, &belt, stripes).await?;
            println!("Member {member_id} is now {belt} belt, {stripes} stripes");
        }
        Commands::ProfileImage { member_id, out } => {
            let png = proxy.profile_image(&member_id).await?;
            if png.is_empty() {
                anyhow::bail!("member {member_id} has no profile image");
            }
            std::fs::write(&out, &png).with_context(|| format!("writing {}", out.display()))?;
            println!("Saved {} bytes to {}", png.len(), out.display());
        }
        Commands::Attendance { member_id } => print_json(&proxy.attendance(&member_id).await?)?,
        Commands::AddClass {
            name,
            day,
            start,
            duration,
        } => {
            let class = serde_json::json!({
                "name": name,
                "day_of_week": day,
                "start_time": start,
                "duration_minutes": duration,
            });
            print_json(&proxy.add_class(&class.to_string()).await?)?;
        }
        Commands::Classes => print_json(&proxy.classes().await?)?,
        Commands::Session { action } => match action {
            SessionAction::Start => {
                if proxy.start_session().await? {
                    println!("Session started");
                } else {
                    println!("Session already running");
                }
            }
            SessionAction::Stop => {
                if proxy.stop_session().await? {
                    println!("Session stopped");
                } else {
                    println!("No session running");
                }
            }
            SessionAction::Faces => print_json(&proxy.faces().await?)?,
            SessionAction::EnrollFace { index, details } => {
                print_json(&proxy.enroll_face(index, &details.to_json(None)).await?)?
            }
            SessionAction::RefreshGallery => {
                let count = proxy.refresh_gallery().await?;
                println!("Gallery holds {count} members");
            }
        },
    }

    Ok(())
}
