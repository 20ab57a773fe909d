//! GitStash command-line uploader.

mod api;
mod upload;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use api::ApiClient;

#[derive(Parser, Debug)]
#[command(
    name = "gitstash",
    version,
    about = "Resumable chunked uploads to a GitStash server"
)]
struct Cli {
    /// Server endpoint, e.g. https://uploads.example.com
    #[arg(long, env = "GITSTASH_ENDPOINT")]
    endpoint: String,

    /// Shared service credential.
    #[arg(long, env = "GITSTASH_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Owner id to act as.
    #[arg(long, env = "GITSTASH_USER_ID")]
    user_id: Uuid,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, chunk by chunk.
    Upload {
        file: PathBuf,

        /// Logical folder the file should appear under.
        #[arg(long, default_value = "/")]
        folder: String,

        /// Resume a previous session instead of starting fresh.
        #[arg(long)]
        resume: Option<Uuid>,
    },

    /// Show the resumable state of a session.
    Status { upload_id: Uuid },

    /// Abort a session and discard its staged chunks.
    Abort { upload_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ApiClient::new(&cli.endpoint, &cli.api_key, cli.user_id)?;

    match cli.command {
        Command::Upload {
            file,
            folder,
            resume,
        } => {
            let result = upload::upload_file(&api, &file, &folder, resume).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Status { upload_id } => {
            let status = api.status(upload_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Abort { upload_id } => {
            api.abort(upload_id).await?;
            println!("aborted {upload_id}");
        }
    }

    Ok(())
}
