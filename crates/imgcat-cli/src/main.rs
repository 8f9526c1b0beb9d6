use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgcat_core::{CanonicalImageRecord, RegistrationRequest};
use imgcat_sync::{open_catalog, CatalogConfig, SyncPipeline};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "imgcat")]
#[command(about = "Image catalog sync and registry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mirror every connection target's images into a namespace.
    SyncAll {
        #[arg(long)]
        ns: String,
    },
    /// Mirror a single connection target.
    Sync {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        connection: String,
    },
    /// Register one image after looking it up through the driver.
    Register {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        connection: String,
        #[arg(long)]
        csp_image_id: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Get {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        id: String,
    },
    List {
        #[arg(long)]
        ns: String,
    },
    /// Images whose name contains every keyword.
    Search {
        #[arg(long)]
        ns: String,
        keywords: Vec<String>,
    },
    /// Merge a partial JSON record into an existing image.
    Update {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        patch: String,
    },
    Delete {
        #[arg(long)]
        ns: String,
        #[arg(long)]
        id: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CatalogConfig::from_env()?;
    let catalog = Arc::new(open_catalog(&config).await?);

    match cli.command {
        Commands::SyncAll { ns } => {
            let summary = SyncPipeline::new(catalog).sync_all(&ns).await?;
            print_json(&summary)?;
        }
        Commands::Sync { ns, connection } => {
            let count = SyncPipeline::new(catalog)
                .sync_target(&connection, &ns)
                .await?;
            print_json(&serde_json::json!({ "connectionName": connection, "imageCount": count }))?;
        }
        Commands::Register {
            ns,
            name,
            connection,
            csp_image_id,
            description,
        } => {
            let request = RegistrationRequest {
                name,
                connection_name: connection,
                csp_image_id,
                description,
            };
            let record = catalog.register_with_request(&ns, &request).await?;
            print_json(&record)?;
        }
        Commands::Get { ns, id } => print_json(&catalog.get_image(&ns, &id).await?)?,
        Commands::List { ns } => print_json(&catalog.list_images(&ns).await?)?,
        Commands::Search { ns, keywords } => {
            print_json(&catalog.search_images(&ns, keywords.as_slice()).await?)?
        }
        Commands::Update { ns, id, patch } => {
            let partial: CanonicalImageRecord =
                serde_json::from_str(&patch).context("parsing --patch as an image record")?;
            print_json(&catalog.update_image(&ns, &id, partial).await?)?;
        }
        Commands::Delete { ns, id } => {
            catalog.delete_image(&ns, &id).await?;
            print_json(&serde_json::json!({ "deleted": id }))?;
        }
    }

    Ok(())
}
