use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;

#[zbus::proxy(
    interface = "org.rollcall.Recognition1",
    default_service = "org.rollcall.Recognition1",
    default_path = "/org/rollcall/Recognition1"
)]
trait Recognition {
    fn register(&self, image_path: &str, identity: &str) -> zbus::Result<String>;
    fn recognize(&self, image_path: &str, session_id: &str, save_results: bool) -> zbus::Result<String>;
    fn detect(&self, image_path: &str) -> zbus::Result<String>;
    fn session_results(&self, session_id: &str) -> zbus::Result<String>;
    fn remove_student(&self, identity: &str) -> zbus::Result<String>;
    fn clear_cache(&self, identity: &str) -> zbus::Result<String>;
    fn cache_stats(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom face recognition CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a photo containing exactly one face
    Register {
        /// Student identifier (e.g. roll number)
        identity: String,
        /// Path to the photo
        image: String,
    },
    /// Recognize all faces in a photo
    Recognize {
        /// Path to the photo
        image: String,
        /// Append to an existing session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
        /// Do not record the result in the session log
        #[arg(long)]
        no_save: bool,
    },
    /// Detect faces without recognizing them
    Detect {
        /// Path to the photo
        image: String,
    },
    /// Show all recorded results for a session
    Session {
        /// Session id (UUID)
        id: String,
    },
    /// Remove a student's stored embedding
    Remove {
        identity: String,
    },
    /// Drop cached embeddings (all of them unless an identity is given)
    Clear {
        identity: Option<String>,
    },
    /// Show embedding cache statistics
    Stats,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = RecognitionProxy::new(&connection)
        .await
        .context("cannot reach rollcalld; is the daemon running?")?;

    let reply = match cli.command {
        Commands::Register { identity, image } => proxy.register(&absolute(&image)?, &identity).await?,
        Commands::Recognize {
            image,
            session,
            no_save,
        } => {
            proxy
                .recognize(&absolute(&image)?, session.as_deref().unwrap_or(""), !no_save)
                .await?
        }
        Commands::Detect { image } => proxy.detect(&absolute(&image)?).await?,
        Commands::Session { id } => proxy.session_results(&id).await?,
        Commands::Remove { identity } => proxy.remove_student(&identity).await?,
        Commands::Clear { identity } => proxy.clear_cache(identity.as_deref().unwrap_or("")).await?,
        Commands::Stats => proxy.cache_stats().await?,
        Commands::Status => proxy.status().await?,
    };

    let (pretty, success) = render(&reply)?;
    println!("{pretty}");
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(image: &str) -> Result<String> {
    let path = Path::new(image)
        .canonicalize()
        .with_context(|| format!("cannot find image {image}"))?;
    Ok(path.display().to_string())
}

/// Pretty-print a daemon reply and report its `success` flag.
fn render(reply: &str) -> Result<(String, bool)> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon returned malformed JSON")?;
    let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    Ok((serde_json::to_string_pretty(&value)?, success))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_recognize_args() {
        let cli = Cli::try_parse_from(["rollcall", "recognize", "class.jpg", "--session", "abc", "--no-save"]).unwrap();
        match cli.command {
            Commands::Recognize {
                image,
                session,
                no_save,
            } => {
                assert_eq!(image, "class.jpg");
                assert_eq!(session.as_deref(), Some("abc"));
                assert!(no_save);
            }
            _ => panic!("expected recognize"),
        }
    }

    #[test]
    fn test_clear_without_identity() {
        let cli = Cli::try_parse_from(["rollcall", "clear"]).unwrap();
        assert!(matches!(cli.command, Commands::Clear { identity: None }));
    }

    #[test]
    fn test_render_reports_success_flag() {
        let (_, ok) = render(r#"{"success":true,"count":2}"#).unwrap();
        assert!(ok);
        let (pretty, ok) = render(r#"{"success":false,"error":"no face detected in the image"}"#).unwrap();
        assert!(!ok);
        assert!(pretty.contains("no face detected"));
        assert!(render("not json").is_err());
    }

    #[test]
    fn test_absolute_missing_image() {
        assert!(absolute("/nonexistent/rollcall/photo.jpg").is_err());
    }
}
