//! Sharestate demo - two consumers sharing one document through the
//! in-memory store.
//!
//! The first consumer waits for a document that does not exist yet, a
//! creator creates it, and a second consumer watching a different slice only
//! hears about the changes that touch its slice.

use std::sync::Arc;

use serde_json::json;
use sharestate_client::{Config, DocumentCreator, MemoryBackend, SessionCache, SharedStateProvider};
use sharestate_engine::{path, projector, OpComponent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sharestate_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        release_delay = ?config.release_delay,
        dev_warnings = config.dev_warnings,
        "Starting sharestate demo"
    );

    let backend = MemoryBackend::new();
    let provider = SharedStateProvider::managed(Arc::new(backend.clone()), config);

    provider
        .scope(async {
            let cache = SessionCache::current()?;

            // The store delivers nothing until flushed; do that in the background
            let pump = tokio::spawn({
                let backend = backend.clone();
                async move {
                    loop {
                        backend.flush();
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                }
            });

            let waiting = tokio::spawn({
                let cache = cache.clone();
                async move { cache.access("notes", "demo").await }
            });

            DocumentCreator::current()?.create(
                "notes",
                "demo",
                json!({"doc_id": "demo", "count1": 0, "count2": 0}),
            );

            let mut whole = waiting.await??;
            tracing::info!(state = %whole.state(), "first consumer loaded the document");

            let mut count2 = cache
                .access_with("notes", "demo", Some(projector(|doc| doc["count2"].clone())))
                .await?;

            let dispatcher = whole.dispatcher();
            dispatcher
                .dispatch(OpComponent::number_add(path!["count1"], 1))
                .await?;
            dispatcher
                .dispatch(OpComponent::number_add(path!["count2"], 5))
                .await?;

            if let Some(state) = whole.changed().await {
                tracing::info!(state = %state, "whole document changed");
            }
            if let Some(state) = count2.changed().await {
                tracing::info!(count2 = %state, "count2 changed");
            }
            tracing::info!(
                skipped = count2.try_changed().is_none(),
                "count2 consumer did not hear about count1"
            );

            drop(whole);
            drop(count2);
            tracing::info!(sessions = cache.len(), "consumers released");

            pump.abort();
            Ok::<_, Box<dyn std::error::Error>>(())
        })
        .await?;

    Ok(())
}
