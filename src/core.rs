//! Dependency-injection root: one `Core` owns the store, the event bus
//! and the three pipelines. Nothing in the crate is a process-wide
//! singleton; the binary builds exactly one of these.

use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::intake::{self, FileRecord};
use crate::pipeline::{AnalyzerPipeline, CrfSearchPipeline, Dispatcher, EncoderPipeline};
use crate::store::{ServiceType, Store};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Core {
    pub store: Store,
    pub bus: EventBus,
    analyzer: Arc<AnalyzerPipeline>,
    crf_searcher: Arc<CrfSearchPipeline>,
    encoder: Arc<EncoderPipeline>,
    analyzer_dispatch: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Core {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::new(&config.database.path).await?;
        let bus = EventBus::default();

        tokio::fs::create_dir_all(&config.paths.temp_dir).await?;

        let analyzer_dispatch = Dispatcher::new();
        let search_dispatch = Dispatcher::new();
        let encode_dispatch = Dispatcher::new();

        let analyzer = Arc::new(AnalyzerPipeline::new(
            store.clone(),
            bus.clone(),
            config.analyzer.clone(),
            analyzer_dispatch.clone(),
            search_dispatch.clone(),
        ));
        let crf_searcher = Arc::new(CrfSearchPipeline::new(
            store.clone(),
            bus.clone(),
            config.crf_search.clone(),
            config.paths.temp_dir.clone(),
            search_dispatch,
            encode_dispatch.clone(),
        ));
        let encoder = Arc::new(EncoderPipeline::new(
            store.clone(),
            bus.clone(),
            config.encoder.clone(),
            config.paths.temp_dir.clone(),
            encode_dispatch,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            store,
            bus,
            analyzer,
            crf_searcher,
            encoder,
            analyzer_dispatch,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Launch the three pipelines. They run until `shutdown` is called.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!("Starting pipelines");
        let analyzer = self.analyzer.clone();
        let crf_searcher = self.crf_searcher.clone();
        let encoder = self.encoder.clone();
        let rx = self.shutdown_rx.clone();

        vec![
            tokio::spawn({
                let rx = rx.clone();
                async move { analyzer.run(rx).await }
            }),
            tokio::spawn({
                let rx = rx.clone();
                async move { crf_searcher.run(rx).await }
            }),
            tokio::spawn(async move { encoder.run(rx).await }),
        ]
    }

    /// Signal every pipeline to stop; in-flight children are killed.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn analyzer(&self) -> &AnalyzerPipeline {
        &self.analyzer
    }

    /// Feed a batch of synced service records into the store and wake the
    /// analyzer.
    pub async fn ingest(
        &self,
        service_type: ServiceType,
        records: &[FileRecord],
    ) -> Result<usize> {
        intake::ingest(
            &self.store,
            &self.bus,
            &self.analyzer_dispatch,
            service_type,
            records,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("test.db");
        config.paths.temp_dir = dir.path().join("tmp");

        let core = Core::new(config).await.unwrap();
        let handles = core.start();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        core.shutdown();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(10), handle)
                .await
                .expect("pipeline did not stop")
                .unwrap();
        }
    }
}
