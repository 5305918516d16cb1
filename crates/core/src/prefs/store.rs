use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PrefValue, Preference, PreferenceError, PreferenceTable};
use crate::engine::Engine;

/// A preference table that pushes changes to the engine.
pub struct PreferenceStore {
    table: Mutex<PreferenceTable>,
    engine: Arc<dyn Engine>,
}

impl PreferenceStore {
    /// Create a store holding the defaults.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_table(engine, PreferenceTable::new())
    }

    pub fn with_table(engine: Arc<dyn Engine>, table: PreferenceTable) -> Self {
        Self {
            table: Mutex::new(table),
            engine,
        }
    }

    /// Swap in a freshly loaded table. Nothing is applied.
    pub async fn replace(&self, table: PreferenceTable) {
        *self.table.lock().await = table;
    }

    /// Copy of the current table, for persistence.
    pub async fn snapshot(&self) -> PreferenceTable {
        self.table.lock().await.clone()
    }

    /// Current value of `name`, falling back to (and storing) the default.
    pub async fn get(&self, name: &str) -> Result<PrefValue, PreferenceError> {
        self.table.lock().await.get(name)
    }

    /// Current value of a known preference.
    pub async fn value(&self, pref: Preference) -> PrefValue {
        self.table.lock().await.value(pref)
    }

    /// Store `value` under `name` and apply it to the engine.
    ///
    /// The value stays stored even when applying it fails; the error is
    /// returned to the caller.
    pub async fn set(&self, name: &str, value: PrefValue) -> Result<(), PreferenceError> {
        let (pref, stored) = {
            let mut table = self.table.lock().await;
            let pref = table.set(name, value)?;
            (pref, table.current(pref))
        };
        info!(preference = %pref, value = %stored, "Preference updated");

        if let Some(apply) = pref.apply_fn() {
            apply(self.engine.as_ref(), &stored)
                .await
                .map_err(|source| PreferenceError::Apply {
                    name: pref.name(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Push every applicable preference to the engine.
    ///
    /// All preferences are attempted; the first failure is returned.
    pub async fn apply_all(&self) -> Result<(), PreferenceError> {
        let mut first_error = None;

        for pref in Preference::ALL {
            let Some(apply) = pref.apply_fn() else {
                continue;
            };
            let value = self.value(pref).await;
            debug!(preference = %pref, value = %value, "Applying preference");

            if let Err(source) = apply(self.engine.as_ref(), &value).await {
                warn!(preference = %pref, error = %source, "Failed to apply preference");
                first_error.get_or_insert(PreferenceError::Apply {
                    name: pref.name(),
                    source,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Active torrent limit, `None` when unlimited.
    pub async fn max_active_torrents(&self) -> Option<usize> {
        match self.value(Preference::MaxActiveTorrents).await.as_int() {
            Some(n) if n >= 0 => Some(n as usize),
            _ => None,
        }
    }

    /// Auto-seed demotion ratio, `None` when disabled.
    pub async fn auto_seed_ratio(&self) -> Option<f64> {
        match self.value(Preference::AutoSeedRatio).await.as_float() {
            Some(ratio) if ratio >= 0.0 => Some(ratio),
            _ => None,
        }
    }

    pub async fn use_dht(&self) -> bool {
        self.value(Preference::UseDht)
            .await
            .as_bool()
            .unwrap_or(true)
    }

    pub async fn queue_seeds_to_bottom(&self) -> bool {
        self.value(Preference::QueueSeedsToBottom)
            .await
            .as_bool()
            .unwrap_or(false)
    }

    pub async fn auto_end_seeding(&self) -> bool {
        self.value(Preference::AutoEndSeeding)
            .await
            .as_bool()
            .unwrap_or(false)
    }

    pub async fn clear_max_ratio_torrents(&self) -> bool {
        self.value(Preference::ClearMaxRatioTorrents)
            .await
            .as_bool()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::testing::{EngineCall, MockEngine};

    fn store() -> (Arc<MockEngine>, PreferenceStore) {
        let engine = Arc::new(MockEngine::new());
        let store = PreferenceStore::new(Arc::clone(&engine) as Arc<dyn Engine>);
        (engine, store)
    }

    #[tokio::test]
    async fn test_get_default_before_set() {
        let (_, store) = store();
        assert_eq!(store.get("max_uploads").await.unwrap(), PrefValue::Int(2));
    }

    #[tokio::test]
    async fn test_set_applies_to_engine() {
        let (engine, store) = store();
        store.set("max_uploads", PrefValue::Int(6)).await.unwrap();

        assert_eq!(store.get("max_uploads").await.unwrap(), PrefValue::Int(6));
        assert_eq!(engine.calls().await, vec![EngineCall::SetMaxUploads(6)]);
    }

    #[tokio::test]
    async fn test_set_without_apply_fn_makes_no_engine_call() {
        let (engine, store) = store();
        store
            .set("max_active_torrents", PrefValue::Int(2))
            .await
            .unwrap();

        assert!(engine.calls().await.is_empty());
        assert_eq!(store.max_active_torrents().await, Some(2));
    }

    #[tokio::test]
    async fn test_set_unknown_fails_without_change() {
        let (engine, store) = store();
        let before = store.snapshot().await;

        let err = store.set("bogus_key", PrefValue::Int(1)).await.unwrap_err();
        assert!(matches!(err, PreferenceError::Unknown(_)));
        assert_eq!(store.snapshot().await, before);
        assert!(engine.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_still_stores_value() {
        let (engine, store) = store();
        engine
            .fail_next("set_upload_rate_limit", EngineError::Unavailable("down".into()))
            .await;

        let err = store
            .set("max_upload_rate", PrefValue::Int(50_000))
            .await
            .unwrap_err();
        assert!(matches!(err, PreferenceError::Apply { name: "max_upload_rate", .. }));
        assert_eq!(
            store.get("max_upload_rate").await.unwrap(),
            PrefValue::Int(50_000)
        );
    }

    #[tokio::test]
    async fn test_apply_all_pushes_every_setter() {
        let (engine, store) = store();
        store.apply_all().await.unwrap();

        let calls = engine.calls().await;
        assert_eq!(calls.len(), 5);
        assert!(calls.contains(&EngineCall::SetMaxUploads(2)));
        assert!(calls.contains(&EngineCall::SetListenOn(6881, 9999)));
        assert!(calls.contains(&EngineCall::SetMaxConnections(80)));
        assert!(calls.contains(&EngineCall::SetDownloadRateLimit(-1)));
        assert!(calls.contains(&EngineCall::SetUploadRateLimit(-1)));
    }

    #[tokio::test]
    async fn test_apply_all_continues_after_failure() {
        let (engine, store) = store();
        engine
            .fail_next("set_max_uploads", EngineError::Internal("nope".into()))
            .await;

        let err = store.apply_all().await.unwrap_err();
        assert!(matches!(err, PreferenceError::Apply { name: "max_uploads", .. }));
        // The failed setter is not recorded; the other four are.
        assert_eq!(engine.calls().await.len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_sentinels() {
        let (_, store) = store();
        assert_eq!(store.max_active_torrents().await, None);
        assert_eq!(store.auto_seed_ratio().await, None);

        store.set("auto_seed_ratio", PrefValue::Float(1.5)).await.unwrap();
        assert_eq!(store.auto_seed_ratio().await, Some(1.5));
    }
}
