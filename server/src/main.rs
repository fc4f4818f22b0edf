use clap::Parser;
use log::{error, info};
use server::auth::{MojangVerifier, ServerKeys, DEFAULT_SESSION_SERVER};
use server::console::run_console;
use server::metadata::Metadata;
use server::network::{Server, ServerContext};
use server::storage::{MemoryStore, CHUNK_LOG_FILE};
use shared::DEFAULT_MAX_FRAME_SIZE;
use std::path::PathBuf;
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, loads the data directory, then runs the
/// listener and the operator console side by side.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, env = "HOST", default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, env = "PORT", default_value = "12312")]
        port: u16,
        /// Directory holding config, whitelist, uuid cache and chunk log
        #[clap(short, long, env = "MAPSYNC_DATA_DIR", default_value = "./mapsync")]
        data_dir: PathBuf,
        /// Largest accepted frame in bytes
        #[clap(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
        max_frame_size: usize,
        /// Identity service base URL
        #[clap(long, default_value = DEFAULT_SESSION_SERVER)]
        session_server: String,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let metadata = Arc::new(Metadata::load(&args.data_dir).await?);
    info!(
        "Expecting game address {} (whitelist {})",
        metadata.config().game_address,
        if metadata.config().whitelist { "on" } else { "off" }
    );

    let store = MemoryStore::open(args.data_dir.join(CHUNK_LOG_FILE)).await?;

    info!("Generating server keypair");
    let keys = ServerKeys::generate()?;

    let context = ServerContext::new(
        Arc::new(keys),
        Arc::new(MojangVerifier::new(args.session_server)),
        metadata.clone(),
        metadata.clone(),
        Arc::new(store),
    )
    .with_max_frame_size(args.max_frame_size);

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, context).await?;
    let clients = server.clients();

    let server_handle = tokio::spawn(server.run());
    let console_handle = tokio::spawn(run_console(metadata, clients));

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
        }
        result = console_handle => {
            if let Err(e) = result {
                error!("Console task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
