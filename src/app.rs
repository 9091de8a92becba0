//! Process-wide application context.
//!
//! One [`AppContext`] is built at startup and shared (behind an `Arc`) by
//! every request handler and background loop. It owns the single
//! [`VectorIndex`] and [`TaskExecutor`] instances together with the store
//! and the external collaborators.

use std::sync::Arc;

use anyhow::Result;
use chrono::{FixedOffset, Utc};

use attendance_core::store::{EmbeddingStore, Store};

use crate::config::Config;
use crate::db;
use crate::face::{create_extractor, FaceExtractor};
use crate::index::VectorIndex;
use crate::migrate;
use crate::recognition::RecognitionService;
use crate::retry::RetryPolicy;
use crate::sheets::{create_sheet_sink, SheetSink};
use crate::sqlite_store::SqliteStore;
use crate::storage::{create_object_sink, ObjectSink};
use crate::tasks::TaskExecutor;

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub index: Arc<VectorIndex>,
    pub executor: Arc<TaskExecutor>,
    pub extractor: Arc<dyn FaceExtractor>,
    pub sheets: Arc<dyn SheetSink>,
    pub objects: Arc<dyn ObjectSink>,
    pub recognition: RecognitionService,
    offset: FixedOffset,
}

impl AppContext {
    /// Open the SQLite database (creating the schema if needed) and build
    /// the collaborators named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_schema(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool));
        Self::from_parts(
            config.clone(),
            store,
            Arc::from(create_extractor(&config.face)?),
            Arc::from(create_sheet_sink(&config.sheets)?),
            Arc::from(create_object_sink(&config.storage)?),
        )
    }

    /// Assemble a context from an explicit store and collaborators.
    pub fn from_parts<S>(
        config: Config,
        store: Arc<S>,
        extractor: Arc<dyn FaceExtractor>,
        sheets: Arc<dyn SheetSink>,
        objects: Arc<dyn ObjectSink>,
    ) -> Result<Self>
    where
        S: Store + 'static,
    {
        let offset = config.attendance.offset()?;
        let embeddings: Arc<dyn EmbeddingStore> = store.clone();
        let store: Arc<dyn Store> = store;

        let index = Arc::new(VectorIndex::new(embeddings));
        let executor = Arc::new(TaskExecutor::from_config(&config.tasks));
        let recognition = RecognitionService::new(store.clone(), index.clone(), extractor.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            index,
            executor,
            extractor,
            sheets,
            objects,
            recognition,
            offset,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.tasks.retry_policy()
    }

    /// Current time at the configured offset, to the second, RFC 3339.
    pub fn now_iso(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string()
    }
}
