//! CLI client for a minirepo server

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use minirepo::common::{format_bytes, Sha256Hasher};
use minirepo::coordinator::http::CHECKSUM_HEADER;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

#[derive(Parser)]
#[command(name = "minirepo")]
#[command(about = "minirepo artifact repository CLI")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(long, default_value = "http://localhost:5080", env = "MINIREPO_URL")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List projects
    Projects,

    /// Create a project
    CreateProject {
        key: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },

    /// Move a project to a new key
    RenameProject { key: String, new_key: String },

    /// Delete a project and all its artifacts
    DeleteProject { key: String },

    /// List artifacts of a project
    Artifacts { project: String },

    /// Upload a new artifact version
    Push {
        project: String,
        version: String,
        /// File to upload
        #[arg(long)]
        file: PathBuf,
    },

    /// Download an artifact version
    Pull {
        project: String,
        version: String,
        /// Output file
        #[arg(long)]
        output: PathBuf,
    },

    /// Delete an artifact version
    DeleteArtifact { project: String, version: String },

    /// Ask the server to check metadata against content
    Verify {
        /// Re-hash every file
        #[arg(long)]
        deep: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = cli.server.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Projects => {
            let projects = expect_json(client.get(format!("{}/projects", base)).send().await?).await?;
            for p in projects.as_array().into_iter().flatten() {
                println!(
                    "{:<24} artifacts: {:<4} latest: {:<16} stable: {}",
                    p["key"].as_str().unwrap_or("?"),
                    p["artifact_count"],
                    version_of(&p["latest_version"]),
                    version_of(&p["latest_stable_version"]),
                );
            }
        }

        Commands::CreateProject {
            key,
            name,
            description,
        } => {
            let body = json!({ "key": key, "name": name, "description": description });
            let project =
                expect_json(client.post(format!("{}/projects", base)).json(&body).send().await?)
                    .await?;
            println!("Created project {} (id {})", key, project["id"]);
        }

        Commands::RenameProject { key, new_key } => {
            let resp = client
                .put(format!("{}/projects/{}", base, key))
                .json(&json!({ "key": new_key }))
                .send()
                .await?;
            expect_success(resp).await?;
            println!("Renamed {} -> {}", key, new_key);
        }

        Commands::DeleteProject { key } => {
            let resp = client.delete(format!("{}/projects/{}", base, key)).send().await?;
            expect_success(resp).await?;
            println!("Deleted project {}", key);
        }

        Commands::Artifacts { project } => {
            let artifacts = expect_json(
                client
                    .get(format!("{}/projects/{}/artifacts", base, project))
                    .send()
                    .await?,
            )
            .await?;
            for a in artifacts.as_array().into_iter().flatten() {
                println!(
                    "{:<16} {:>12} {} {}",
                    a["version"].as_str().unwrap_or("?"),
                    format_bytes(a["file_size_bytes"].as_u64().unwrap_or(0)),
                    a["timestamp"].as_str().unwrap_or("?"),
                    a["file_name"].as_str().unwrap_or("?"),
                );
            }
        }

        Commands::Push {
            project,
            version,
            file,
        } => {
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file path has no usable file name")?
                .to_string();
            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let body = reqwest::Body::wrap_stream(ReaderStream::new(handle));
            let artifact = expect_json(
                client
                    .post(format!("{}/projects/{}/artifacts/{}", base, project, version))
                    .query(&[("file_name", &file_name)])
                    .body(body)
                    .send()
                    .await?,
            )
            .await?;
            println!(
                "Pushed {}/{} ({}, sha256 {})",
                project,
                version,
                format_bytes(artifact["file_size_bytes"].as_u64().unwrap_or(0)),
                artifact["sha256"].as_str().unwrap_or("?"),
            );
        }

        Commands::Pull {
            project,
            version,
            output,
        } => {
            let resp = client
                .get(format!(
                    "{}/projects/{}/artifacts/{}/download",
                    base, project, version
                ))
                .send()
                .await?;
            let resp = expect_success(resp).await?;
            let expected = resp
                .headers()
                .get(CHECKSUM_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let mut out = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("cannot create {}", output.display()))?;
            let mut hasher = Sha256Hasher::new();
            let mut total = 0u64;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                out.write_all(&chunk).await?;
                total += chunk.len() as u64;
            }
            out.flush().await?;

            let actual = hasher.finalize();
            if let Some(expected) = expected {
                if !expected.eq_ignore_ascii_case(&actual) {
                    bail!("checksum mismatch: expected {}, got {}", expected, actual);
                }
            }
            println!(
                "Pulled {}/{} to {} ({})",
                project,
                version,
                output.display(),
                format_bytes(total)
            );
        }

        Commands::DeleteArtifact { project, version } => {
            let resp = client
                .delete(format!("{}/projects/{}/artifacts/{}", base, project, version))
                .send()
                .await?;
            expect_success(resp).await?;
            println!("Deleted {}/{}", project, version);
        }

        Commands::Verify { deep } => {
            let report = expect_json(
                client
                    .post(format!("{}/admin/verify", base))
                    .query(&[("deep", deep)])
                    .send()
                    .await?,
            )
            .await?;
            println!("Verification report:");
            println!("  Projects: {}", report["total_projects"]);
            println!("  Artifacts: {}", report["total_artifacts"]);
            println!("  Healthy: {}", report["healthy"]);
            for field in [
                "missing",
                "size_mismatch",
                "corrupted",
                "orphaned_files",
                "orphaned_dirs",
            ] {
                let count = report[field].as_array().map_or(0, |a| a.len());
                println!("  {}: {}", field, count);
            }
        }
    }

    Ok(())
}

fn version_of(released: &Value) -> &str {
    released["version"].as_str().unwrap_or("-")
}

async fn expect_success(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let message = resp
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| v["error"].as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| status.to_string());
    bail!("server returned {}: {}", status, message)
}

async fn expect_json(resp: reqwest::Response) -> anyhow::Result<Value> {
    Ok(expect_success(resp).await?.json().await?)
}
