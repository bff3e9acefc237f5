//! Command-line interface for the PasteSync service

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::directory::{PeerDirectory, TrustState};
use crate::identity::DeviceIdentity;
use crate::paste::{BlobStore, Encryptor, FileRef, PasteContent, PasteRecord, PasteStore};
use crate::sync::{Reconciler, SyncEngine};

#[derive(Parser)]
#[command(name = "pastesync")]
#[command(about = "Cross-device paste record synchronization service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the sync daemon in the foreground")]
    Start,

    #[command(about = "Show local device status")]
    Status,

    #[command(about = "List known peer devices")]
    Peers,

    #[command(about = "Show recent paste records")]
    Records {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    #[command(about = "Add a paste record from text or files")]
    Add {
        /// Text content
        text: Option<String>,

        /// Files to attach instead of text
        #[arg(short, long)]
        file: Vec<PathBuf>,
    },

    #[command(about = "Delete a paste record")]
    Delete { id: uuid::Uuid },

    #[command(about = "Pin or unpin a record")]
    Favorite {
        id: uuid::Uuid,

        /// Remove the pin instead of setting it
        #[arg(long)]
        unset: bool,
    },

    #[command(about = "Trust a device fingerprint")]
    Trust { fingerprint: String },

    #[command(about = "Revoke trust in a device fingerprint")]
    Revoke { fingerprint: String },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate an example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

/// Executes CLI commands against the local state
pub struct CliHandler {
    config: Config,
    config_path: Option<PathBuf>,
}

impl CliHandler {
    /// Load configuration and build a handler
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = Config::load(config_path.as_deref())?;
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Dispatch a parsed command
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Start => self.cmd_start().await,
            Commands::Status => self.cmd_status().await,
            Commands::Peers => self.cmd_peers().await,
            Commands::Records { limit } => self.cmd_records(limit).await,
            Commands::Add { text, file } => self.cmd_add(text, file).await,
            Commands::Delete { id } => self.cmd_delete(id).await,
            Commands::Favorite { id, unset } => self.cmd_favorite(id, !unset).await,
            Commands::Trust { fingerprint } => self.cmd_trust(&fingerprint, true).await,
            Commands::Revoke { fingerprint } => self.cmd_trust(&fingerprint, false).await,
            Commands::Config { action } => self.cmd_config(action).await,
        }
    }

    async fn cmd_start(&self) -> Result<()> {
        let engine = SyncEngine::bootstrap(self.config.clone()).await?;
        engine.start().await
    }

    async fn cmd_status(&self) -> Result<()> {
        let identity = DeviceIdentity::load_or_create(&self.config.security.identity_key)?;
        let directory = PeerDirectory::load(self.config.security.trust_db.clone()).await?;
        let store = self.open_store().await?;

        println!("Device:      {} ({})", self.config.device_name, self.config.device_id);
        println!("Fingerprint: {}", identity.fingerprint());
        println!("Listen:      {}", self.config.network.listen_addr);
        println!("Records:     {}", store.live_count().await?);

        let devices = directory.all().await;
        let trusted = devices.iter().filter(|d| d.is_trusted()).count();
        println!("Devices:     {} known, {} trusted", devices.len(), trusted);
        Ok(())
    }

    async fn cmd_peers(&self) -> Result<()> {
        let directory = PeerDirectory::load(self.config.security.trust_db.clone()).await?;
        let devices = directory.all().await;

        if devices.is_empty() {
            println!("No known devices.");
            return Ok(());
        }

        for device in devices {
            let trust = match device.trust {
                TrustState::Trusted => "trusted",
                TrustState::Rejected => "rejected",
                TrustState::Pending => "pending",
            };
            let addr = device
                .addresses
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {}  [{}]  {}  {}",
                device.id,
                device.name,
                trust,
                addr,
                device.fingerprint.as_deref().unwrap_or("(no fingerprint)"),
            );
        }
        Ok(())
    }

    async fn cmd_records(&self, limit: usize) -> Result<()> {
        let store = self.open_store().await?;
        let records = store.recent(limit).await?;

        if records.is_empty() {
            println!("No paste records.");
            return Ok(());
        }

        for record in records {
            println!(
                "{}  {}  {:>6}  {}{}",
                record.id,
                record.updated_at.format("%Y-%m-%d %H:%M:%S"),
                record.content.kind(),
                preview(&record),
                if record.favorite { "  *" } else { "" },
            );
        }
        Ok(())
    }

    async fn cmd_add(&self, text: Option<String>, files: Vec<PathBuf>) -> Result<()> {
        let (reconciler, _store) = self.open_reconciler().await?;

        let content = if !files.is_empty() {
            let blobs = BlobStore::open(&self.config.storage.blob_dir)?;
            let mut refs = Vec::with_capacity(files.len());
            for path in &files {
                let data = std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let hash = blobs.put(&data)?;
                refs.push(FileRef {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "file".to_string()),
                    size: data.len() as u64,
                    hash,
                });
            }
            PasteContent::Files(refs)
        } else if let Some(text) = text {
            PasteContent::Text(text)
        } else {
            return Err(anyhow!("provide text or at least one --file"));
        };

        let record = reconciler.create_local(content).await?;
        println!("{}", record.id);
        Ok(())
    }

    async fn cmd_delete(&self, id: uuid::Uuid) -> Result<()> {
        let (reconciler, _store) = self.open_reconciler().await?;
        reconciler.delete_local(&id).await?;
        info!("Deleted record {}", id);
        Ok(())
    }

    async fn cmd_favorite(&self, id: uuid::Uuid, favorite: bool) -> Result<()> {
        let (reconciler, _store) = self.open_reconciler().await?;
        reconciler.set_favorite(&id, favorite).await?;
        Ok(())
    }

    async fn cmd_trust(&self, fingerprint: &str, trust: bool) -> Result<()> {
        let directory = PeerDirectory::load(self.config.security.trust_db.clone()).await?;
        let state = if trust {
            TrustState::Trusted
        } else {
            TrustState::Rejected
        };

        let affected = directory.set_trust(fingerprint, state).await?;
        if affected.is_empty() {
            return Err(anyhow!(
                "no known device with fingerprint {fingerprint}; run `pastesync peers` first"
            ));
        }

        for id in affected {
            println!(
                "{} device {}",
                if trust { "Trusted" } else { "Revoked" },
                id
            );
        }
        Ok(())
    }

    async fn cmd_config(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&self.config)?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                let path = self
                    .config_path
                    .clone()
                    .unwrap_or_else(Config::default_path);
                if path.exists() && !force {
                    return Err(anyhow!(
                        "{} already exists; use --force to overwrite",
                        path.display()
                    ));
                }
                let config = Config::default();
                config.save(&path)?;
                println!("Wrote {}", path.display());
                Ok(())
            }
            ConfigAction::Validate => {
                self.config.validate()?;
                println!("Configuration is valid.");
                Ok(())
            }
        }
    }

    async fn open_store(&self) -> Result<Arc<PasteStore>> {
        let encryptor = Encryptor::new(&self.config.security.store_key)?;
        Ok(Arc::new(
            PasteStore::open(&self.config.storage.database, encryptor).await?,
        ))
    }

    async fn open_reconciler(&self) -> Result<(Arc<Reconciler>, Arc<PasteStore>)> {
        let store = self.open_store().await?;
        let blobs = BlobStore::open(&self.config.storage.blob_dir)?;
        let (reconciler, _pull_rx) =
            Reconciler::new(self.config.device_id, store.clone(), blobs);
        Ok((reconciler, store))
    }
}

fn preview(record: &PasteRecord) -> String {
    const MAX: usize = 48;
    let text = match &record.content {
        PasteContent::Text(text) => text.clone(),
        PasteContent::Html { plain, .. } => plain.clone(),
        PasteContent::Rtf(data) => format!("<rtf, {} bytes>", data.len()),
        PasteContent::Image { mime_type, data } => {
            format!("<{mime_type}, {} bytes>", data.len())
        }
        PasteContent::Files(files) => {
            let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
            names.join(", ")
        }
        PasteContent::Color(argb) => format!("#{argb:08x}"),
    };

    let flat = text.replace(['\n', '\r'], " ");
    if flat.len() > MAX {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{cut}…")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_start() {
        let cli = Cli::parse_from(["pastesync", "start"]);
        assert!(matches!(cli.command, Commands::Start));
    }

    #[test]
    fn test_cli_parses_add_with_files() {
        let cli = Cli::parse_from(["pastesync", "add", "--file", "a.txt", "--file", "b.txt"]);
        match cli.command {
            Commands::Add { text, file } => {
                assert!(text.is_none());
                assert_eq!(file.len(), 2);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_preview_truncates() {
        let record = PasteRecord::new(
            uuid::Uuid::new_v4(),
            PasteContent::Text("x".repeat(200)),
        );
        let p = preview(&record);
        assert!(p.chars().count() <= 49);
        assert!(p.ends_with('…'));
    }
}
