//! espconnect - event stream processing client
//!
//! Connects to a server, follows the configured windows and optionally
//! publishes synthetic events into a source window.

use espconnect_client::{
    Client, Config, Datasource, DatasourceDelegate, DatasourceOptions, PublisherOptions, Row,
    StatsDelegate, StatsSnapshot, SyntheticSource,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if ESPCONNECT_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let conn_config = match config.connection_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Connecting to {}", config.server.url);
    let client = Client::connect(conn_config).await?;
    tracing::info!("Connected (protocol {})", client.version());

    let logger: Arc<dyn DatasourceDelegate> = Arc::new(
        |source: &dyn Datasource, rows: &[Row], cleared: bool| {
            if cleared {
                tracing::info!("{}: reloaded, {} rows", source.window(), source.len());
            }
            for row in rows {
                tracing::info!("{}: {}", source.window(), serde_json::Value::Object(row.clone()));
            }
        },
    );

    let mut streams = Vec::new();
    for window in &config.demo.streams {
        let options = DatasourceOptions::new(window.as_str()).with_maxevents(config.demo.maxevents);
        match client.event_stream(options, Some(logger.clone())).await {
            Ok(stream) => {
                tracing::info!("Following stream {}", window);
                streams.push(stream);
            }
            Err(e) => tracing::error!("Cannot open stream {}: {}", window, e),
        }
    }

    let mut collections = Vec::new();
    for window in &config.demo.collections {
        match client
            .event_collection(DatasourceOptions::new(window.as_str()), Some(logger.clone()))
            .await
        {
            Ok(collection) => {
                tracing::info!("Following collection {}", window);
                collections.push(collection);
            }
            Err(e) => tracing::error!("Cannot open collection {}: {}", window, e),
        }
    }

    if config.demo.stats {
        let printer: Arc<dyn StatsDelegate> = Arc::new(|stats: &StatsSnapshot| {
            for w in stats.windows.iter().take(5) {
                tracing::info!("stats {}: cpu={:.1}% count={}", w.key, w.cpu, w.count);
            }
        });
        client.stats().add_delegate(printer);
    }

    let source = match config.demo.publish {
        Some(ref publish) => {
            let options = PublisherOptions::new(publish.window.as_str()).with_binary(publish.binary);
            let publisher = client.publisher(options).await?;
            tracing::info!("Publishing into {}", publish.window);
            Some(Arc::new(SyntheticSource::new(publisher, publish.source.clone())))
        }
        None => None,
    };

    let source_handle = source.clone().map(|source| {
        tokio::spawn(async move {
            source.run().await;
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, closing subscriptions...");

    if let Some(ref source) = source {
        source.shutdown();
    }
    if let Some(handle) = source_handle {
        let _ = handle.await;
    }

    for stream in &streams {
        stream.close();
    }
    for collection in &collections {
        collection.close();
    }
    client.stop();

    tracing::info!("Client stopped");
    Ok(())
}
