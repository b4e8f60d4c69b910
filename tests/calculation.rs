use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use approx::assert_relative_eq;
use rusqlite::Connection;

use lca_engine::allocation::AllocationMethod;
use lca_engine::cache::MatrixCache;
use lca_engine::calculator::{self, SimpleResult};
use lca_engine::contribution::{ContributionTreeNode, TreeOptions};
use lca_engine::db::{self, SqliteStore, Store};
use lca_engine::error::{CalcError, DataWarning, Result};
use lca_engine::impact::ImpactTable;
use lca_engine::index::{self, ProductIndex};
use lca_engine::inventory::InventoryBuilder;
use lca_engine::library::{self, Library, LibraryInfo};
use lca_engine::models::{
    AllocationFactor, Descriptor, ExchangeRow, FlowType, ImpactFactorRow, ModelType, ProcessLink,
    ProcessProduct, ProductSystem,
};
use lca_engine::sample;
use lca_engine::setup::CalculationSetup;
use lca_engine::solver::LinearSolver;

fn descriptor(id: i64, name: &str) -> Descriptor {
    Descriptor { id, ref_id: format!("ref-{}", name), name: name.to_string() }
}

fn exchange(id: i64, process_id: i64, flow_id: i64, amount: f64, is_input: bool) -> ExchangeRow {
    ExchangeRow {
        id,
        process_id,
        flow_id,
        amount,
        is_input,
        is_elementary: false,
        property_factor_id: 0,
        unit_id: 0,
        location_id: None,
        default_provider_id: None,
    }
}

/// P1 <- P2 <- P3, each needing one unit of its supplier's product; only P3
/// emits, 2 units of flow 100 per unit.
fn chain(conn: &Connection) -> Result<()> {
    for (id, name) in [(1, "p1"), (2, "p2"), (3, "p3")] {
        db::insert_process(conn, &descriptor(id, name))?;
    }
    for (id, name) in [(11, "product-1"), (12, "product-2"), (13, "product-3")] {
        db::insert_flow(conn, &descriptor(id, name), FlowType::Product)?;
    }
    db::insert_flow(conn, &descriptor(100, "emission"), FlowType::Elementary)?;

    let rows = [
        exchange(1, 1, 11, 1.0, false),
        exchange(2, 1, 12, 1.0, true),
        exchange(3, 2, 12, 1.0, false),
        exchange(4, 2, 13, 1.0, true),
        exchange(5, 3, 13, 1.0, false),
        exchange(6, 3, 100, 2.0, false),
    ];
    for row in &rows {
        db::insert_exchange(conn, row)?;
    }
    db::insert_product_system(
        conn,
        &ProductSystem {
            id: 1,
            name: "chain".to_string(),
            reference: ProcessProduct::of(1, 11),
            target_amount: 1.0,
            links: vec![
                ProcessLink { provider_id: 2, flow_id: 12, process_id: 1 },
                ProcessLink { provider_id: 3, flow_id: 13, process_id: 2 },
            ],
        },
        "ps-chain",
    )?;
    Ok(())
}

fn store_with(load: impl FnOnce(&Connection) -> Result<()>) -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().unwrap();
    store.with_connection(load).unwrap();
    Arc::new(store)
}

fn assert_sums(node: &ContributionTreeNode) {
    if node.children.is_empty() {
        return;
    }
    assert_relative_eq!(node.direct + node.children_sum(), node.amount, max_relative = 1e-9);
    for child in &node.children {
        assert_sums(child);
    }
}

#[test]
fn linear_chain_scenario() {
    let cache = MatrixCache::create(store_with(chain)).unwrap();
    let result = calculator::calculate(&cache, &CalculationSetup::new(1)).unwrap();

    assert_relative_eq!(result.flow_result(100, None).unwrap(), 2.0);
    assert_eq!(result.inventory.tech_index.providers()[0], ProcessProduct::of(1, 11));

    let tree = result.flow_tree(100, None, &TreeOptions::default()).unwrap();
    let root = &tree.root;
    assert_relative_eq!(root.amount, 2.0);
    assert_eq!(root.children.len(), 1);
    let p2 = &root.children[0];
    assert_eq!(p2.provider, ProcessProduct::of(2, 12));
    assert_relative_eq!(p2.amount, 2.0);
    assert_eq!(p2.children.len(), 1);
    let p3 = &p2.children[0];
    assert_eq!(p3.provider, ProcessProduct::of(3, 13));
    assert_relative_eq!(p3.amount, 2.0);
    assert!(p3.children.is_empty());
    assert_sums(root);
}

#[test]
fn sample_database_results() {
    let cache = MatrixCache::create(store_with(sample::load_sample_data)).unwrap();
    let setup = CalculationSetup {
        impact_method_id: Some(sample::SAMPLE_METHOD),
        ..CalculationSetup::new(sample::SAMPLE_SYSTEM)
    };
    let result = calculator::calculate(&cache, &setup).unwrap();

    // 2 kWh = 7.2 MJ of electricity per kg of steel
    let electricity = ProcessProduct::of(sample::ELECTRICITY_PRODUCTION, sample::ELECTRICITY);
    assert_relative_eq!(result.scaling_factor(&electricity).unwrap(), 7200.0, max_relative = 1e-12);
    assert_relative_eq!(result.total_requirement(&electricity).unwrap(), 7200.0, max_relative = 1e-12);

    assert_relative_eq!(result.flow_result(sample::CARBON_DIOXIDE, None).unwrap(), 3660.0, max_relative = 1e-12);
    assert_relative_eq!(result.flow_result(sample::SULFUR_DIOXIDE, None).unwrap(), 14.4, max_relative = 1e-12);
    assert_relative_eq!(result.flow_result(sample::HARD_COAL, None).unwrap(), 756.0, max_relative = 1e-12);

    assert_relative_eq!(result.impact_result(sample::CLIMATE_CHANGE).unwrap(), 3660.0, max_relative = 1e-12);
    assert_relative_eq!(result.impact_result(sample::ACIDIFICATION).unwrap(), 14.4, max_relative = 1e-12);
    // resources consumed count positive
    assert_relative_eq!(result.impact_result(sample::RESOURCE_DEPLETION).unwrap(), 378.0, max_relative = 1e-12);
    assert!(result.warnings.is_empty());

    let tree = result.impact_tree(sample::CLIMATE_CHANGE, &TreeOptions::default()).unwrap();
    assert_relative_eq!(tree.root.amount, 3660.0, max_relative = 1e-9);
    assert_relative_eq!(tree.root.direct, 1500.0, max_relative = 1e-9);
    assert_relative_eq!(tree.root.children[0].amount, 2160.0, max_relative = 1e-9);
    assert_sums(&tree.root);

    let summary = calculator::summarize(&result, cache.store()).unwrap().to_string();
    assert!(summary.contains("steel production | steel"));
    assert!(summary.contains("Climate change"));
}

#[test]
fn mixed_direction_flow_is_net_in_row_direction() {
    let store = store_with(|conn| {
        chain(conn)?;
        // P2 consumes half a unit of the flow P3 emits
        db::insert_exchange(conn, &exchange(7, 2, 100, 0.5, true))
    });
    let cache = MatrixCache::create(store).unwrap();
    let result = calculator::calculate(&cache, &CalculationSetup::new(1)).unwrap();

    let flow_index = &result.inventory.flow_index;
    assert_eq!(flow_index.size(), 1);
    let pos = flow_index.index_of(100, None).unwrap();
    assert!(flow_index.is_input(pos));
    // 0.5 consumed against 2 emitted
    assert_relative_eq!(result.flow_result(100, None).unwrap(), -1.5, max_relative = 1e-12);
}

#[test]
fn physical_allocation_scales_the_reference_process() {
    let cache = MatrixCache::create(store_with(sample::load_sample_data)).unwrap();
    let setup = CalculationSetup {
        allocation: AllocationMethod::Physical,
        amount: Some(1.0),
        ..CalculationSetup::new(sample::SAMPLE_SYSTEM)
    };
    let result = calculator::calculate(&cache, &setup).unwrap();
    // 90% of 1.5 kg direct plus 90% of 7.2 MJ at 0.3 kg/MJ
    assert_relative_eq!(
        result.flow_result(sample::CARBON_DIOXIDE, None).unwrap(),
        0.9 * 1.5 + 0.9 * 7.2 * 0.3,
        max_relative = 1e-12
    );
    assert_eq!(result.inventory.allocation, AllocationMethod::Physical);
}

#[test]
fn missing_process_degrades_to_warning() {
    let store = store_with(|conn| {
        chain(conn)?;
        // link P3's product to a process without any exchanges
        db::insert_process(conn, &descriptor(4, "p4"))?;
        db::insert_exchange(conn, &exchange(7, 3, 14, 1.0, true))?;
        db::insert_flow(conn, &descriptor(14, "product-4"), FlowType::Product)?;
        let system = ProductSystem {
            id: 2,
            name: "broken".to_string(),
            reference: ProcessProduct::of(1, 11),
            target_amount: 1.0,
            links: vec![
                ProcessLink { provider_id: 2, flow_id: 12, process_id: 1 },
                ProcessLink { provider_id: 3, flow_id: 13, process_id: 2 },
                ProcessLink { provider_id: 4, flow_id: 14, process_id: 3 },
            ],
        };
        db::insert_product_system(conn, &system, "ps-broken")
    });
    let cache = MatrixCache::create(store).unwrap();
    let tech_index = ProductIndex::from_system(&cache.store().product_system(2).unwrap().unwrap()).freeze();
    assert_eq!(tech_index.size(), 4);

    let inventory = InventoryBuilder::new(&cache, AllocationMethod::None).build(tech_index);
    assert_eq!(inventory.warnings, vec![DataWarning::MissingProcess { process_id: 4 }]);
    // the empty column makes the system singular
    let solved = SimpleResult::of(inventory, None, &LinearSolver::default(), &|| false);
    assert!(matches!(solved, Err(CalcError::Unsolvable { .. })));
}

#[test]
fn unknown_product_system_is_invalid_input() {
    let cache = MatrixCache::create(store_with(chain)).unwrap();
    assert!(matches!(
        calculator::calculate(&cache, &CalculationSetup::new(42)),
        Err(CalcError::InvalidInput(_))
    ));
}

#[test]
fn auto_link_builds_the_same_chain() {
    let cache = MatrixCache::create(store_with(chain)).unwrap();
    let system = index::auto_link(&cache, ProcessProduct::of(1, 11), 1.0).unwrap();
    assert_eq!(system.links.len(), 2);
    assert!(system.links.contains(&ProcessLink { provider_id: 3, flow_id: 13, process_id: 2 }));
    let tech_index = ProductIndex::from_system(&system).freeze();
    assert_eq!(tech_index.providers(), &[
        ProcessProduct::of(1, 11),
        ProcessProduct::of(2, 12),
        ProcessProduct::of(3, 13)
    ]);
}

#[test]
fn empty_impact_category_yields_empty_list() {
    let store = store_with(|conn| {
        db::insert_impact_method(conn, &descriptor(1, "method"))?;
        db::insert_impact_category(conn, &descriptor(5, "empty"), 1)
    });
    let cache = MatrixCache::create(store).unwrap();
    assert!(cache.impact_factors().get(&5).is_empty());
    let all = cache.impact_factors().get_all(&[5, 6]);
    assert_eq!(all.len(), 2);
    assert!(all[&6].is_empty());
}

#[test]
fn impact_factors_prefer_matching_location() {
    let store = store_with(|conn| {
        db::insert_flow(conn, &descriptor(100, "nox"), FlowType::Elementary)?;
        db::insert_location(conn, &descriptor(7, "de"))?;
        db::insert_impact_method(conn, &descriptor(1, "method"))?;
        db::insert_impact_category(conn, &descriptor(1, "acid"), 1)?;
        for (location_id, amount) in [(None, 1.0), (Some(7), 3.0)] {
            db::insert_impact_factor(
                conn,
                &ImpactFactorRow {
                    impact_category_id: 1,
                    flow_id: 100,
                    amount,
                    formula: None,
                    property_factor_id: 0,
                    unit_id: 0,
                    location_id,
                    distribution_type: Some(2),
                    parameter1: Some(amount),
                    parameter2: Some(0.1),
                    parameter3: None,
                },
            )?;
        }
        Ok(())
    });
    let cache = MatrixCache::create(store).unwrap();
    let flows = lca_engine::index::FlowIndex::from_flows([
        lca_engine::models::IndexFlow::output(100).at(Some(7)),
        lca_engine::models::IndexFlow::output(100).at(Some(8)),
        lca_engine::models::IndexFlow::input(100),
    ]);
    let table = ImpactTable::build(&cache, 1, &flows).unwrap();
    assert_eq!(table.factors.get(0, 0), 3.0);
    assert_eq!(table.factors.get(0, 1), 1.0);
    assert_eq!(table.factors.get(0, 2), -1.0);

    let factors = cache.impact_factors().get(&1);
    assert!(factors.iter().all(|f| f.uncertainty.is_some()));
}

/// Counts calls into the impact factor and exchange queries of the wrapped
/// store.
struct CountingStore {
    inner: SqliteStore,
    impact_loads: AtomicUsize,
    exchange_loads: AtomicUsize,
    broken_category: Option<i64>,
}

impl CountingStore {
    fn sample() -> Arc<Self> {
        Self::with_broken_category(None)
    }

    /// Impact factor queries for `broken_category` fail.
    fn with_broken_category(broken_category: Option<i64>) -> Arc<Self> {
        let inner = SqliteStore::in_memory().unwrap();
        inner.with_connection(sample::load_sample_data).unwrap();
        Arc::new(CountingStore {
            inner,
            impact_loads: AtomicUsize::new(0),
            exchange_loads: AtomicUsize::new(0),
            broken_category,
        })
    }
}

impl Store for CountingStore {
    fn descriptors(&self, kind: ModelType) -> Result<Vec<Descriptor>> {
        self.inner.descriptors(kind)
    }

    fn exchanges(&self, process_id: i64) -> Result<Vec<ExchangeRow>> {
        self.exchange_loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(10));
        self.inner.exchanges(process_id)
    }

    fn allocation_factors(&self, process_id: i64) -> Result<Vec<AllocationFactor>> {
        self.inner.allocation_factors(process_id)
    }

    fn impact_factors(&self, impact_category_id: i64) -> Result<Vec<ImpactFactorRow>> {
        self.impact_loads.fetch_add(1, Ordering::SeqCst);
        // widen the window in which concurrent requests could race
        std::thread::sleep(std::time::Duration::from_millis(20));
        if self.broken_category == Some(impact_category_id) {
            return Err(CalcError::InvalidInput("broken category".to_string()));
        }
        self.inner.impact_factors(impact_category_id)
    }

    fn unit_factors(&self) -> Result<Vec<(i64, f64)>> {
        self.inner.unit_factors()
    }

    fn property_factors(&self) -> Result<Vec<(i64, f64)>> {
        self.inner.property_factors()
    }

    fn impact_categories(&self, method_id: i64) -> Result<Vec<Descriptor>> {
        self.inner.impact_categories(method_id)
    }

    fn product_system(&self, id: i64) -> Result<Option<ProductSystem>> {
        self.inner.product_system(id)
    }

    fn providers_of(&self, flow_id: i64) -> Result<Vec<i64>> {
        self.inner.providers_of(flow_id)
    }
}

#[test]
fn concurrent_cache_requests_load_once() {
    let store = CountingStore::sample();
    let cache = MatrixCache::create(store.clone()).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let factors = cache.impact_factors().get(&sample::CLIMATE_CHANGE);
                assert_eq!(factors.len(), 1);
            });
        }
    });
    assert_eq!(store.impact_loads.load(Ordering::SeqCst), 1);

    // a different key loads independently
    cache.impact_factors().get(&sample::ACIDIFICATION);
    assert_eq!(store.impact_loads.load(Ordering::SeqCst), 2);
}

#[test]
fn parallel_calculations_share_exchange_loads() {
    let store = CountingStore::sample();
    let cache = MatrixCache::create(store.clone()).unwrap();
    let setup = CalculationSetup::new(sample::SAMPLE_SYSTEM);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let result = calculator::calculate(&cache, &setup).unwrap();
                assert_relative_eq!(
                    result.flow_result(sample::CARBON_DIOXIDE, None).unwrap(),
                    3660.0,
                    max_relative = 1e-12
                );
            });
        }
    });
    // one load per process of the system
    assert_eq!(store.exchange_loads.load(Ordering::SeqCst), 3);
}

#[test]
fn warnings_belong_to_their_calculation() {
    let store = CountingStore::with_broken_category(Some(sample::ACIDIFICATION));
    let cache = MatrixCache::create(store).unwrap();
    let with_method = CalculationSetup {
        impact_method_id: Some(sample::SAMPLE_METHOD),
        ..CalculationSetup::new(sample::SAMPLE_SYSTEM)
    };
    let result = calculator::calculate(&cache, &with_method).unwrap();
    assert_eq!(result.warnings.len(), 1);
    assert!(matches!(
        &result.warnings[0],
        DataWarning::LoadFailed { keys, .. } if keys.contains(&sample::ACIDIFICATION)
    ));
    assert_relative_eq!(result.impact_result(sample::ACIDIFICATION).unwrap(), 0.0);

    // the failure stays in the cache but does not concern this calculation
    let result = calculator::calculate(&cache, &CalculationSetup::new(sample::SAMPLE_SYSTEM)).unwrap();
    assert!(result.warnings.is_empty());
    assert_eq!(cache.failures().len(), 1);
}

#[test]
fn library_round_trip_reproduces_results() {
    let store = store_with(sample::load_sample_data);
    let cache = MatrixCache::create(store.clone()).unwrap();
    let setup = CalculationSetup::new(sample::SAMPLE_SYSTEM);
    let inventory = calculator::build_inventory(&cache, &setup).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("steel");
    let written = library::write_library(&folder, &LibraryInfo::new("steel", "1.0.0"), &inventory, store.as_ref())
        .unwrap();
    assert_eq!(written.info().unwrap().name, "steel");

    let found = library::discover(dir.path());
    assert_eq!(found.len(), 1);
    let lib: &Library = &found[0];
    assert_eq!(lib.sync_products(store.as_ref()), inventory.tech_index.providers());
    assert_eq!(lib.sync_elementary_flows(store.as_ref()), inventory.flow_index.flows());

    let electricity = ProcessProduct::of(sample::ELECTRICITY_PRODUCTION, sample::ELECTRICITY);
    assert_eq!(lib.index_of(&electricity, store.as_ref()), Some(1));

    let exchanges = lib.exchanges(&electricity, store.as_ref());
    let output = exchanges.iter().find(|e| e.flow_id == sample::ELECTRICITY).unwrap();
    assert!(!output.is_input);
    assert_relative_eq!(output.amount, 1.0);
    let coal = exchanges.iter().find(|e| e.flow_id == sample::COAL).unwrap();
    assert!(coal.is_input);
    assert_relative_eq!(coal.amount, 0.1);
    assert_eq!(coal.default_provider_id, Some(sample::COAL_MINING));
    let so2 = exchanges.iter().find(|e| e.flow_id == sample::SULFUR_DIOXIDE).unwrap();
    assert!(so2.is_elementary);
    assert_relative_eq!(so2.amount, 0.002);

    let expected = calculator::calculate(&cache, &setup).unwrap();
    let from_library = SimpleResult::of(
        lib.inventory(store.as_ref(), 1000.0).unwrap(),
        None,
        &LinearSolver::default(),
        &|| false,
    )
    .unwrap();
    assert_eq!(expected.flow_results.len(), from_library.flow_results.len());
    for (a, b) in expected.flow_results.iter().zip(&from_library.flow_results) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
}

#[test]
fn library_from_another_store_is_not_used() {
    let store = store_with(sample::load_sample_data);
    let cache = MatrixCache::create(store.clone()).unwrap();
    let inventory = calculator::build_inventory(&cache, &CalculationSetup::new(sample::SAMPLE_SYSTEM)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let lib = library::write_library(dir.path(), &LibraryInfo::new("steel", "1"), &inventory, store.as_ref()).unwrap();

    let other = store_with(chain);
    assert!(lib.sync_products(other.as_ref()).is_empty());
    assert!(lib.sync_elementary_flows(other.as_ref()).is_empty());
    assert!(lib.index_of(&ProcessProduct::of(1, 10), other.as_ref()).is_none());
    assert!(lib.exchanges(&ProcessProduct::of(1, 10), other.as_ref()).is_empty());
    assert!(matches!(
        lib.inventory(other.as_ref(), 1.0),
        Err(CalcError::LibraryMismatch { .. })
    ));
}

#[test]
fn corrupted_flow_index_is_a_library_mismatch() {
    let store = store_with(sample::load_sample_data);
    let cache = MatrixCache::create(store.clone()).unwrap();
    let inventory = calculator::build_inventory(&cache, &CalculationSetup::new(sample::SAMPLE_SYSTEM)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let lib = library::write_library(dir.path(), &LibraryInfo::new("steel", "1"), &inventory, store.as_ref()).unwrap();

    let path = dir.path().join("index_B.json");
    let json = std::fs::read_to_string(&path).unwrap();
    assert!(json.contains("\"flow-co2\""));
    std::fs::write(&path, json.replace("\"flow-co2\"", "\"flow-unknown\"")).unwrap();

    assert_eq!(lib.sync_products(store.as_ref()).len(), 3);
    assert!(lib.sync_elementary_flows(store.as_ref()).is_empty());
    assert!(matches!(
        lib.inventory(store.as_ref(), 1000.0),
        Err(CalcError::LibraryMismatch { .. })
    ));
    let electricity = ProcessProduct::of(sample::ELECTRICITY_PRODUCTION, sample::ELECTRICITY);
    assert!(lib.exchanges(&electricity, store.as_ref()).is_empty());
}

#[test]
fn exports_csv_indices() {
    let store = store_with(sample::load_sample_data);
    let cache = MatrixCache::create(store.clone()).unwrap();
    let inventory = calculator::build_inventory(&cache, &CalculationSetup::new(sample::SAMPLE_SYSTEM)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    lca_engine::export::write_csv_indices(dir.path(), &inventory, store.as_ref()).unwrap();

    let tech = std::fs::read_to_string(dir.path().join("index_A.csv")).unwrap();
    let lines: Vec<&str> = tech.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "index,process_id,process_name,flow_id,flow_name");
    assert_eq!(lines[1], "0,proc-steel,steel production,flow-steel,steel");
    assert_eq!(lines[2], "1,proc-electricity,\"electricity, hard coal\",flow-electricity,electricity");

    let flows = std::fs::read_to_string(dir.path().join("index_B.csv")).unwrap();
    assert!(flows.contains("flow-hard-coal,\"hard coal, in ground\",input,"));
    assert_eq!(flows.lines().count(), 4);
}
