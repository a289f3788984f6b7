use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tether_arbiter::{Arbitration, InstanceState};
use tether_client::{
    BlobStore, Client, ClientConfig, ClientError, ClientUpdate, Envelope, MemoryBackend,
    ReadFileRequest, SqliteBlobStore,
};
use tether_transport::native::BroadcastHub;
use tether_transport::storage::StorageArea;
use tether_transport::{Channel, ContextKind, Platform};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "TETHER_SIM_CONFIG")]
    config: Option<PathBuf>,
    /// Number of simulated tabs
    #[arg(long, short, env = "TETHER_SIM_TABS", default_value_t = 3)]
    tabs: usize,
    /// Zero-based indexes of tabs that run as background instances
    #[arg(long, value_delimiter = ',')]
    background: Vec<usize>,
    /// Force a transport (native, store, storage)
    #[arg(long, env = "TETHER_SIM_TRANSPORT")]
    transport: Option<String>,
    /// Delay between tab launches in milliseconds
    #[arg(long, default_value_t = 500)]
    stagger_ms: u64,
    /// How long the last tab runs before everything closes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    linger_ms: u64,
    /// Install a channel in place of the shared hub; native probing then fails
    #[arg(long)]
    replace_hub: bool,
}

struct Tab {
    index: usize,
    client: Arc<Client>,
    backend: Arc<MemoryBackend>,
    run: tokio::task::JoinHandle<Result<Arbitration, ClientError>>,
}

/// Shared capabilities every simulated tab sees.
struct Browser {
    hub: Arc<BroadcastHub>,
    storage: Arc<StorageArea>,
    store_path: PathBuf,
    blobs: Arc<dyn BlobStore>,
}

impl Browser {
    fn platform(&self, background: bool) -> Platform {
        let context = if background {
            ContextKind::Background
        } else {
            ContextKind::Window
        };
        Platform::window()
            .with_context(context)
            .with_native(Arc::clone(&self.hub))
            .with_store_path(self.store_path.clone())
            .with_storage(self.storage.document())
    }
}

fn launch(
    browser: &Browser,
    config: &ClientConfig,
    index: usize,
    background: bool,
) -> Result<Tab, ClientError> {
    let mut options = config.client_options()?;
    options.arbiter.is_background = background;

    let (backend, responses) = MemoryBackend::new();
    backend.add_local_file(
        index as i64,
        &format!("/tabs/{index}/file"),
        format!("tab {index} payload").into_bytes(),
    );
    let client = Arc::new(Client::new(
        &browser.platform(background),
        backend.clone(),
        responses,
        Arc::clone(&browser.blobs),
        options,
    )?);

    let mut updates = client.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                ClientUpdate::State(state) => info!(tab = index, %state, "state changed"),
                ClientUpdate::Backend(envelope) => {
                    info!(tab = index, kind = envelope.type_name(), "backend update")
                }
            }
        }
    });

    let runner = Arc::clone(&client);
    let run = tokio::spawn(async move { runner.run().await });
    info!(tab = index, uid = %client.uid(), background, "tab opened");
    Ok(Tab {
        index,
        client,
        backend,
        run,
    })
}

async fn exercise(tab: &Tab) {
    if tab.client.state() != InstanceState::Active {
        return;
    }
    match tab
        .client
        .send(Envelope::new("getMe").with("@extra", json!({ "tab": tab.index })))
        .await
    {
        Ok(response) => info!(tab = tab.index, kind = response.type_name(), "call answered"),
        Err(err) => warn!(tab = tab.index, "call failed: {err}"),
    }

    let file_id = tab.index as i64;
    tab.backend.emit(Envelope::new("updateFile").with(
        "file",
        json!({
            "id": file_id,
            "size": 64,
            "local": { "path": format!("/tabs/{}/file", tab.index), "is_downloading_active": true }
        }),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;
    match tab.client.read_file(&ReadFileRequest::range(file_id, 0, 3)).await {
        Ok(part) => info!(
            tab = tab.index,
            bytes = part.data.len(),
            origin = ?part.origin,
            "file part read"
        ),
        Err(err) => warn!(tab = tab.index, "file read failed: {err}"),
    }

    match tab.client.send(Envelope::new("getStorageStatistics")).await {
        Ok(_) => warn!(tab = tab.index, "denylisted call unexpectedly reached the backend"),
        Err(err) => info!(tab = tab.index, code = err.code(), "denylisted call refused"),
    }
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = match ClientConfig::load(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!("config load failed: {err}");
            std::process::exit(1);
        }
    };
    if cli.transport.is_some() {
        config.transport = cli.transport.clone();
    }

    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            error!("scratch dir unavailable: {err}");
            std::process::exit(1);
        }
    };
    let store_path = config
        .store_path
        .clone()
        .unwrap_or_else(|| scratch.path().join("channels.db"));
    let blobs = match &config.blob_store_path {
        Some(path) => SqliteBlobStore::open(path),
        None => SqliteBlobStore::in_memory(),
    };
    let blobs: Arc<dyn BlobStore> = match blobs {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("blob store open failed: {err}");
            std::process::exit(1);
        }
    };

    let browser = Browser {
        hub: BroadcastHub::new(),
        storage: StorageArea::new(),
        store_path,
        blobs,
    };
    if cli.replace_hub {
        if let Err(err) = Channel::install_as_primitive(&browser.hub) {
            error!("hub replacement failed: {err}");
            std::process::exit(1);
        }
    }

    let mut tabs = Vec::with_capacity(cli.tabs);
    for index in 0..cli.tabs {
        if index > 0 {
            tokio::time::sleep(Duration::from_millis(cli.stagger_ms)).await;
        }
        match launch(&browser, &config, index, cli.background.contains(&index)) {
            Ok(tab) => tabs.push(tab),
            Err(err) => {
                error!(tab = index, "tab failed to open: {err}");
                std::process::exit(1);
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(cli.linger_ms)).await;

    for tab in &mut tabs {
        match (&mut tab.run).await {
            Ok(Ok(outcome)) => info!(tab = tab.index, ?outcome, "arbitration settled"),
            Ok(Err(err)) => warn!(tab = tab.index, "arbitration failed: {err}"),
            Err(err) => warn!(tab = tab.index, "run task failed: {err}"),
        }
        exercise(tab).await;
    }

    let active: Vec<usize> = tabs
        .iter()
        .filter(|tab| tab.client.state() == InstanceState::Active)
        .map(|tab| tab.index)
        .collect();
    for tab in &tabs {
        println!(
            "tab {} uid={} state={} backend={:?}",
            tab.index,
            tab.client.uid(),
            tab.client.state(),
            tab.backend.posted_types()
        );
    }
    match active.as_slice() {
        [index] => println!("active tab: {index}"),
        [] => println!("no active tab"),
        many => warn!(?many, "more than one active tab"),
    }

    for tab in &tabs {
        tab.client.close().await;
    }
}
