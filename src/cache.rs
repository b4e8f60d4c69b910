//! Memoizing, concurrency-safe caches over the backing store
//!
//! A [`LoadingCache`] maps each key to a single cell that is initialized at
//! most once: concurrent requests for a cold key block on the same cell
//! instead of loading it again. Loads never fail from the caller's point of
//! view. A failed load is logged, recorded as a [`DataWarning`] and the
//! affected keys are answered with an empty value.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::conversion::ConversionTable;
use crate::db::Store;
use crate::error::{DataWarning, Result};
use crate::models::{
    AllocationFactor, CalcExchange, ExchangeRow, ImpactFactor, ImpactFactorRow, Uncertainty,
    UncertaintyType,
};

/// Loads values for cache keys from a backing source.
pub trait Loader<K, V>: Send + Sync {
    fn load(&self, key: &K) -> Result<V>;

    /// Loads several keys at once. Keys without rows may be missing from the
    /// returned map; the cache fills them.
    fn load_all(&self, keys: &[K]) -> Result<HashMap<K, V>>;
}

/// One cache entry. `loading` is held by whoever is loading the value, so
/// that other requests for the key wait instead of loading it again.
struct Cell<V> {
    value: OnceLock<Arc<V>>,
    loading: Mutex<()>,
}

impl<V> Default for Cell<V> {
    fn default() -> Self {
        Self { value: OnceLock::new(), loading: Mutex::new(()) }
    }
}

impl<V> Cell<V> {
    /// The value, loading it with `load` unless another caller is already
    /// doing so, in which case this waits for its result.
    fn get_or_load(&self, load: impl FnOnce() -> V) -> Arc<V> {
        if let Some(value) = self.value.get() {
            return value.clone();
        }
        let _loading = self.loading.lock();
        self.value.get_or_init(|| Arc::new(load())).clone()
    }
}

pub struct LoadingCache<K, V> {
    name: &'static str,
    cells: DashMap<K, Arc<Cell<V>>>,
    loader: Box<dyn Loader<K, V>>,
    failures: Mutex<Vec<DataWarning>>,
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone + Into<i64>,
    V: Default,
{
    pub fn new(name: &'static str, loader: impl Loader<K, V> + 'static) -> Self {
        Self {
            name,
            cells: DashMap::new(),
            loader: Box::new(loader),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn cell(&self, key: &K) -> Arc<Cell<V>> {
        // clone the handle so that the map shard is not locked during a load
        self.cells.entry(key.clone()).or_default().clone()
    }

    pub fn get(&self, key: &K) -> Arc<V> {
        self.cell(key).get_or_load(|| self.load_one(key))
    }

    /// Returns exactly one entry per requested key. Cold keys that no other
    /// caller is loading are fetched with one bulk load; the others are
    /// awaited.
    pub fn get_all(&self, keys: &[K]) -> HashMap<K, Arc<V>> {
        let mut seen = HashSet::with_capacity(keys.len());
        let cells: Vec<(K, Arc<Cell<V>>)> = keys
            .iter()
            .filter(|k| seen.insert((*k).clone()))
            .map(|k| (k.clone(), self.cell(k)))
            .collect();

        let mut claimed = Vec::new();
        let mut missing = Vec::new();
        for (key, cell) in &cells {
            if cell.value.get().is_some() {
                continue;
            }
            if let Some(guard) = cell.loading.try_lock() {
                // the previous holder may have just finished
                if cell.value.get().is_none() {
                    missing.push(key.clone());
                    claimed.push(guard);
                }
            }
        }

        if !missing.is_empty() {
            let mut loaded = self.load_many(&missing);
            for (key, cell) in &cells {
                if let Some(value) = loaded.remove(key) {
                    let _ = cell.value.set(Arc::new(value));
                }
            }
        }
        drop(claimed);

        let mut result = HashMap::with_capacity(cells.len());
        for (key, cell) in cells {
            let value = cell.get_or_load(|| self.load_one(&key));
            result.insert(key, value);
        }
        result
    }

    /// The value if it was loaded already; never triggers a load.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.cells.get(key).and_then(|cell| cell.value().value.get().cloned())
    }

    pub fn invalidate(&self, key: &K) {
        self.cells.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.cells.clear();
    }

    pub fn failures(&self) -> Vec<DataWarning> {
        self.failures.lock().clone()
    }

    /// Recorded failures that affected any of `keys`.
    pub fn failures_for(&self, keys: &[K]) -> Vec<DataWarning> {
        let keys: HashSet<i64> = keys.iter().cloned().map(Into::into).collect();
        self.failures
            .lock()
            .iter()
            .filter(|w| match w {
                DataWarning::LoadFailed { keys: failed, .. } => failed.iter().any(|k| keys.contains(k)),
                _ => false,
            })
            .cloned()
            .collect()
    }

    fn load_one(&self, key: &K) -> V {
        match self.loader.load(key) {
            Ok(value) => value,
            Err(e) => {
                self.record_failure(vec![key.clone().into()], e.to_string());
                V::default()
            }
        }
    }

    fn load_many(&self, keys: &[K]) -> HashMap<K, V> {
        let mut map = match self.loader.load_all(keys) {
            Ok(map) => map,
            Err(e) => {
                self.record_failure(keys.iter().cloned().map(Into::into).collect(), e.to_string());
                HashMap::new()
            }
        };
        for key in keys {
            map.entry(key.clone()).or_default();
        }
        map
    }

    fn record_failure(&self, keys: Vec<i64>, message: String) {
        error!(cache = self.name, ?keys, "failed to load: {}", message);
        self.failures.lock().push(DataWarning::LoadFailed {
            cache: self.name,
            keys,
            message,
        });
    }
}

fn group_by<T>(rows: Vec<T>, key: impl Fn(&T) -> i64) -> HashMap<i64, Vec<T>> {
    let mut map: HashMap<i64, Vec<T>> = HashMap::new();
    for row in rows {
        map.entry(key(&row)).or_default().push(row);
    }
    map
}

pub struct ImpactFactorLoader {
    store: Arc<dyn Store>,
    conversions: Arc<ConversionTable>,
}

impl ImpactFactorLoader {
    pub fn new(store: Arc<dyn Store>, conversions: Arc<ConversionTable>) -> Self {
        Self { store, conversions }
    }

    fn factor(&self, row: ImpactFactorRow) -> ImpactFactor {
        let conversion_factor = self
            .conversions
            .impact_conversion(row.property_factor_id, row.unit_id);
        let uncertainty = row
            .distribution_type
            .and_then(UncertaintyType::from_ordinal)
            .map(|kind| Uncertainty {
                kind,
                parameter1: row.parameter1.unwrap_or(0.0),
                parameter2: row.parameter2.unwrap_or(0.0),
                parameter3: row.parameter3.unwrap_or(0.0),
            });
        ImpactFactor {
            impact_category_id: row.impact_category_id,
            flow_id: row.flow_id,
            amount: row.amount,
            formula: row.formula,
            conversion_factor,
            location_id: row.location_id,
            uncertainty,
        }
    }
}

impl Loader<i64, Vec<ImpactFactor>> for ImpactFactorLoader {
    fn load(&self, impact_id: &i64) -> Result<Vec<ImpactFactor>> {
        trace!("load impact factors for category {}", impact_id);
        let rows = self.store.impact_factors(*impact_id)?;
        Ok(rows.into_iter().map(|r| self.factor(r)).collect())
    }

    fn load_all(&self, impact_ids: &[i64]) -> Result<HashMap<i64, Vec<ImpactFactor>>> {
        trace!("load impact factors for {} categories", impact_ids.len());
        let factors: Vec<ImpactFactor> = self
            .store
            .impact_factors_of(impact_ids)?
            .into_iter()
            .map(|r| self.factor(r))
            .collect();
        Ok(group_by(factors, |f| f.impact_category_id))
    }
}

pub struct ExchangeLoader {
    store: Arc<dyn Store>,
    conversions: Arc<ConversionTable>,
}

impl ExchangeLoader {
    pub fn new(store: Arc<dyn Store>, conversions: Arc<ConversionTable>) -> Self {
        Self { store, conversions }
    }

    fn exchange(&self, row: ExchangeRow) -> CalcExchange {
        CalcExchange {
            id: row.id,
            process_id: row.process_id,
            flow_id: row.flow_id,
            amount: row.amount,
            conversion_factor: self
                .conversions
                .exchange_conversion(row.property_factor_id, row.unit_id),
            is_input: row.is_input,
            is_elementary: row.is_elementary,
            location_id: row.location_id,
            default_provider_id: row.default_provider_id,
        }
    }
}

impl Loader<i64, Vec<CalcExchange>> for ExchangeLoader {
    fn load(&self, process_id: &i64) -> Result<Vec<CalcExchange>> {
        trace!("load exchanges of process {}", process_id);
        let rows = self.store.exchanges(*process_id)?;
        Ok(rows.into_iter().map(|r| self.exchange(r)).collect())
    }

    fn load_all(&self, process_ids: &[i64]) -> Result<HashMap<i64, Vec<CalcExchange>>> {
        trace!("load exchanges of {} processes", process_ids.len());
        let exchanges: Vec<CalcExchange> = self
            .store
            .exchanges_of(process_ids)?
            .into_iter()
            .map(|r| self.exchange(r))
            .collect();
        Ok(group_by(exchanges, |e| e.process_id))
    }
}

pub struct AllocationLoader {
    store: Arc<dyn Store>,
}

impl Loader<i64, Vec<AllocationFactor>> for AllocationLoader {
    fn load(&self, process_id: &i64) -> Result<Vec<AllocationFactor>> {
        trace!("load allocation factors of process {}", process_id);
        self.store.allocation_factors(*process_id)
    }

    fn load_all(&self, process_ids: &[i64]) -> Result<HashMap<i64, Vec<AllocationFactor>>> {
        let factors = self.store.allocation_factors_of(process_ids)?;
        Ok(group_by(factors, |f| f.process_id))
    }
}

/// The caches of one store session. Create one per store and share it
/// between the calculations that run against that store.
pub struct MatrixCache {
    store: Arc<dyn Store>,
    conversions: Arc<ConversionTable>,
    impact_factors: LoadingCache<i64, Vec<ImpactFactor>>,
    exchanges: LoadingCache<i64, Vec<CalcExchange>>,
    allocation_factors: LoadingCache<i64, Vec<AllocationFactor>>,
}

impl MatrixCache {
    pub fn create(store: Arc<dyn Store>) -> Result<Self> {
        let conversions = Arc::new(ConversionTable::load(store.as_ref())?);
        Ok(Self {
            impact_factors: LoadingCache::new(
                "impact factors",
                ImpactFactorLoader::new(store.clone(), conversions.clone()),
            ),
            exchanges: LoadingCache::new(
                "exchanges",
                ExchangeLoader::new(store.clone(), conversions.clone()),
            ),
            allocation_factors: LoadingCache::new(
                "allocation factors",
                AllocationLoader { store: store.clone() },
            ),
            store,
            conversions,
        })
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn conversions(&self) -> &ConversionTable {
        &self.conversions
    }

    pub fn impact_factors(&self) -> &LoadingCache<i64, Vec<ImpactFactor>> {
        &self.impact_factors
    }

    pub fn exchanges(&self) -> &LoadingCache<i64, Vec<CalcExchange>> {
        &self.exchanges
    }

    pub fn allocation_factors(&self) -> &LoadingCache<i64, Vec<AllocationFactor>> {
        &self.allocation_factors
    }

    pub fn evict_all(&self) {
        self.impact_factors.invalidate_all();
        self.exchanges.invalidate_all();
        self.allocation_factors.invalidate_all();
    }

    /// All load failures recorded so far, over all caches.
    pub fn failures(&self) -> Vec<DataWarning> {
        let mut failures = self.impact_factors.failures();
        failures.extend(self.exchanges.failures());
        failures.extend(self.allocation_factors.failures());
        failures
    }

    /// Load failures that affect the data of the given processes and impact
    /// categories.
    pub fn failures_for(&self, process_ids: &[i64], impact_category_ids: &[i64]) -> Vec<DataWarning> {
        let mut failures = self.exchanges.failures_for(process_ids);
        failures.extend(self.allocation_factors.failures_for(process_ids));
        failures.extend(self.impact_factors.failures_for(impact_category_ids));
        failures
    }
}
