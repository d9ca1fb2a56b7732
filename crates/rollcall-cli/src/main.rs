use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::registry::scan_dataset;
use rollcall_core::{NewUser, UserRole, UserUpdate};
use rollcall_hw::{acquire, CameraError, CaptureHandle, SystemCameras, V4l2Capture};
use std::path::PathBuf;
use std::time::Duration;
use zbus::Connection;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (also ROLLCALL_SESSION_BUS=1)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reload known faces from the dataset directory
    Reload,
    /// List user ids with loaded faces
    Users,
    /// Manage registered users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
    /// Photograph a registered user into their dataset folder
    Capture {
        #[arg(short, long)]
        user: i64,
    },
    /// Record attendance by hand, outside a recognition session
    Attend {
        #[arg(short, long)]
        user: i64,
        #[arg(short, long)]
        subject: String,
        /// RFC 3339 timestamp (default: now)
        #[arg(long)]
        at: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
        /// Record the user as absent
        #[arg(long)]
        absent: bool,
    },
    /// Start recording attendance for a subject
    Start {
        #[arg(short, long)]
        subject: String,
    },
    /// Stop the running session
    Stop,
    /// Print attendance between two dates (YYYY-MM-DD or RFC 3339)
    Report {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        subject: Option<String>,
        /// Print the raw JSON rows
        #[arg(long, conflicts_with = "csv")]
        json: bool,
        /// Export as CSV
        #[arg(long)]
        csv: bool,
        /// Write the CSV here instead of stdout
        #[arg(short, long, requires = "csv")]
        output: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Check a dataset directory layout without loading any models
    Scan {
        #[arg(short, long)]
        dataset: PathBuf,
        /// Treat any unmappable folder as an error
        #[arg(long)]
        strict: bool,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera URI: /dev/videoN, rtsp://... or an image directory
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a new user
    Create {
        #[arg(long)]
        national_id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "student")]
        role: UserRole,
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        faculty: Option<String>,
        #[arg(long)]
        university: Option<String>,
    },
    /// List registered users
    List {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Show one user
    Get { id: i64 },
    /// Change the given fields of a user
    Update {
        id: i64,
        #[arg(long)]
        national_id: Option<String>,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        faculty: Option<String>,
        #[arg(long)]
        university: Option<String>,
    },
    /// Delete a user and their dataset folder
    Delete { id: i64 },
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn reload(&self) -> zbus::Result<String>;
    fn loaded_users(&self) -> zbus::Result<Vec<i64>>;
    fn start_session(&self, subject: &str) -> zbus::Result<bool>;
    fn stop_session(&self) -> zbus::Result<bool>;
    fn report(&self, start: &str, end: &str, subject: &str) -> zbus::Result<String>;
    fn export_report(&self, start: &str, end: &str, subject: &str) -> zbus::Result<String>;
    fn record_attendance(
        &self,
        user_id: i64,
        subject: &str,
        timestamp: &str,
        confidence: f64,
        status: &str,
    ) -> zbus::Result<String>;
    fn create_user(&self, user: &str) -> zbus::Result<String>;
    fn list_users(&self, offset: u32, limit: u32) -> zbus::Result<String>;
    fn get_user(&self, user_id: i64) -> zbus::Result<String>;
    fn update_user(&self, user_id: i64, update: &str) -> zbus::Result<String>;
    fn delete_user(&self, user_id: i64) -> zbus::Result<()>;
    fn capture_dataset(&self, user_id: i64) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

async fn connect(session: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session {
        Connection::session().await
    } else {
        Connection::system().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let session_bus =
        cli.session || std::env::var("ROLLCALL_SESSION_BUS").is_ok_and(|v| v != "0");

    match cli.command {
        Commands::Reload => {
            let summary: serde_json::Value =
                serde_json::from_str(&connect(session_bus).await?.reload().await?)?;
            println!(
                "Loaded {} embeddings for {} users",
                summary["loaded"], summary["users"]
            );
            if let Some(warnings) = summary["warnings"].as_array() {
                for warning in warnings {
                    println!("  warning: {}", warning.as_str().unwrap_or_default());
                }
            }
        }
        Commands::Users => {
            let users = connect(session_bus).await?.loaded_users().await?;
            if users.is_empty() {
                println!("No users loaded");
            }
            for id in users {
                println!("{id}");
            }
        }
        Commands::User { action } => user_command(connect(session_bus).await?, action).await?,
        Commands::Capture { user } => {
            println!("Look at the camera; capturing images for user {user}...");
            let raw = connect(session_bus).await?.capture_dataset(user).await?;
            let report: serde_json::Value = serde_json::from_str(&raw)?;
            println!(
                "Saved {} images to {}",
                report["images_captured"],
                report["directory"].as_str().unwrap_or_default()
            );
            if report["timed_out"].as_bool().unwrap_or(false) {
                println!("  warning: capture timed out; run `rollcall reload` after retrying");
            }
        }
        Commands::Attend {
            user,
            subject,
            at,
            confidence,
            absent,
        } => {
            let status = if absent { "ABSENT" } else { "PRESENT" };
            let raw = connect(session_bus)
                .await?
                .record_attendance(user, &subject, at.as_deref().unwrap_or(""), confidence, status)
                .await?;
            let record: serde_json::Value = serde_json::from_str(&raw)?;
            println!(
                "Recorded {status} for user {user} in {subject} (row {})",
                record["id"]
            );
        }
        Commands::Start { subject } => {
            if connect(session_bus).await?.start_session(&subject).await? {
                println!("Recording attendance for {subject}");
            } else {
                bail!("a session is already running; stop it first");
            }
        }
        Commands::Stop => {
            if connect(session_bus).await?.stop_session().await? {
                println!("Session stopped");
            } else {
                println!("No session running");
            }
        }
        Commands::Report {
            from,
            to,
            subject,
            json,
            csv,
            output,
        } => {
            let proxy = connect(session_bus).await?;
            let subject = subject.as_deref().unwrap_or("");
            if csv {
                let text = proxy.export_report(&from, &to, subject).await?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, text)
                            .with_context(|| format!("writing {}", path.display()))?;
                        println!("Report written to {}", path.display());
                    }
                    None => print!("{text}"),
                }
                return Ok(());
            }
            let raw = proxy.report(&from, &to, subject).await?;
            if json {
                println!("{raw}");
            } else {
                print_report(&raw)?;
            }
        }
        Commands::Status => {
            let raw = connect(session_bus).await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Scan { dataset, strict } => scan(&dataset, strict)?,
        // RTSP captures drive their own runtime, so keep them off this one.
        Commands::Test { device } => {
            tokio::task::spawn_blocking(move || camera_test(&device)).await??
        }
    }

    Ok(())
}

async fn user_command(proxy: AttendanceProxy<'static>, action: UserCommand) -> Result<()> {
    match action {
        UserCommand::Create {
            national_id,
            first_name,
            last_name,
            role,
            schedule,
            faculty,
            university,
        } => {
            let user = NewUser {
                national_id,
                first_name,
                last_name,
                role,
                schedule,
                faculty,
                university,
            };
            let created: serde_json::Value =
                serde_json::from_str(&proxy.create_user(&serde_json::to_string(&user)?).await?)?;
            println!("Created user {}", created["id"]);
        }
        UserCommand::List { offset, limit } => {
            let users: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.list_users(offset, limit).await?)?;
            if users.is_empty() {
                println!("No users registered");
            }
            for user in &users {
                print_user(user);
            }
        }
        UserCommand::Get { id } => {
            let user: serde_json::Value = serde_json::from_str(&proxy.get_user(id).await?)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        UserCommand::Update {
            id,
            national_id,
            first_name,
            last_name,
            schedule,
            faculty,
            university,
        } => {
            let update = UserUpdate {
                national_id,
                first_name,
                last_name,
                schedule,
                faculty,
                university,
            };
            if update.is_empty() {
                bail!("nothing to update; pass at least one field");
            }
            let user: serde_json::Value =
                serde_json::from_str(&proxy.update_user(id, &serde_json::to_string(&update)?).await?)?;
            print_user(&user);
        }
        UserCommand::Delete { id } => {
            proxy.delete_user(id).await?;
            println!("Deleted user {id}");
        }
    }
    Ok(())
}

fn print_user(user: &serde_json::Value) {
    println!(
        "{:>6}  {:<14} {:<24} {:<8} {}",
        user["id"],
        user["national_id"].as_str().unwrap_or_default(),
        format!(
            "{} {}",
            user["first_name"].as_str().unwrap_or_default(),
            user["last_name"].as_str().unwrap_or_default()
        ),
        user["role"].as_str().unwrap_or_default(),
        user["schedule"].as_str().unwrap_or_default(),
    );
}

fn print_report(raw: &str) -> Result<()> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(raw)?;
    if rows.is_empty() {
        println!("No attendance in range");
        return Ok(());
    }
    println!(
        "{:<25} {:>6}  {:<24} {:<14} {:<16} {:>5}  STATUS",
        "TIMESTAMP", "USER", "NAME", "ID", "SUBJECT", "CONF"
    );
    for row in &rows {
        let name = format!(
            "{} {}",
            row["first_name"].as_str().unwrap_or_default(),
            row["last_name"].as_str().unwrap_or_default()
        );
        println!(
            "{:<25} {:>6}  {:<24} {:<14} {:<16} {:>5.2}  {}",
            row["timestamp"].as_str().unwrap_or_default(),
            row["user_id"],
            name,
            row["national_id"].as_str().unwrap_or_default(),
            row["subject"].as_str().unwrap_or_default(),
            row["confidence"].as_f64().unwrap_or_default(),
            row["status"].as_str().unwrap_or_default(),
        );
    }
    println!("{} rows", rows.len());
    Ok(())
}

fn scan(dataset: &std::path::Path, strict: bool) -> Result<()> {
    let scan = scan_dataset(dataset, strict)
        .with_context(|| format!("scanning {}", dataset.display()))?;

    println!(
        "{} user folders ({})",
        scan.folders.len(),
        if scan.from_manifest { "manifest" } else { "folder names" }
    );
    for folder in &scan.folders {
        println!("  {:>8}  {}", folder.user_id, folder.path.display());
    }
    for warning in &scan.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn camera_test(device: &str) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = V4l2Capture::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut capture = acquire(&SystemCameras, device, Duration::from_secs(5))
        .with_context(|| format!("opening {device}"))?;

    let mut usable = 0;
    for i in 0..5 {
        match capture.read_frame() {
            Ok(Some(frame)) => {
                usable += 1;
                println!("  frame {i}: {}x{}", frame.width(), frame.height());
            }
            Ok(None) => println!("  frame {i}: none (dark or still buffering)"),
            Err(CameraError::EndOfStream(_)) => {
                println!("  frame {i}: source exhausted");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("{usable}/5 usable frames from {device}");
    Ok(())
}
