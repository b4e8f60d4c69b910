//! Libraries: precomputed matrices with their indices on disk
//!
//! A library folder contains `library.json`, the index files `index_A.json`
//! (providers) and `index_B.json` (elementary flows) and matrix files named
//! `<matrix>.npy` or `<matrix>.npz`. Entities are referenced by their stable
//! reference ids so that a library can be mounted on any store holding the
//! same data. A library that does not match the store is not used at all.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::db::Store;
use crate::error::{CalcError, Result};
use crate::index::{FlowIndex, TechIndex};
use crate::inventory::Inventory;
use crate::matrix::Matrix;
use crate::models::{CalcExchange, Descriptor, IndexFlow, ModelType, ProcessProduct};
use crate::{npy, npz};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryMatrix {
    /// Technology matrix
    A,
    /// Intervention matrix
    B,
    /// Impact factors
    C,
    /// Intensities, `B * INV`
    M,
    /// Inverse of `A`
    INV,
}

impl LibraryMatrix {
    pub fn name(&self) -> &'static str {
        match self {
            LibraryMatrix::A => "A",
            LibraryMatrix::B => "B",
            LibraryMatrix::C => "C",
            LibraryMatrix::M => "M",
            LibraryMatrix::INV => "INV",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LibraryInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into(), description: None }
    }
}

#[derive(Serialize)]
struct ProductEntry<'a> {
    process: &'a str,
    flow: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlowEntry<'a> {
    flow: &'a str,
    is_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug)]
pub struct Library {
    pub folder: PathBuf,
    info: OnceLock<LibraryInfo>,
}

impl Library {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self { folder: folder.into(), info: OnceLock::new() }
    }

    /// Metadata from `library.json`, read on first access.
    pub fn info(&self) -> Result<&LibraryInfo> {
        if let Some(info) = self.info.get() {
            return Ok(info);
        }
        let text = fs::read_to_string(self.folder.join("library.json"))?;
        let info: LibraryInfo = serde_json::from_str(&text)?;
        Ok(self.info.get_or_init(|| info))
    }

    pub fn has_matrix(&self, m: LibraryMatrix) -> bool {
        self.npy_path(m).exists() || self.npz_path(m).exists()
    }

    /// Reads a matrix, preferring the `.npy` file. Unreadable files count as
    /// absent.
    pub fn get_matrix(&self, m: LibraryMatrix) -> Option<Matrix> {
        let result = if self.npy_path(m).exists() {
            npy::load(&self.npy_path(m)).map(Some)
        } else if self.npz_path(m).exists() {
            npz::Archive::open(&self.npz_path(m)).and_then(|archive| {
                match archive.matrix(m.name())? {
                    Some(matrix) => Ok(Some(matrix)),
                    None => match archive.names().first() {
                        Some(first) => archive.matrix(first),
                        None => Ok(None),
                    },
                }
            })
        } else {
            Ok(None)
        };
        match result {
            Ok(matrix) => matrix.map(Matrix::Dense),
            Err(e) => {
                error!(folder = %self.folder.display(), matrix = m.name(), "failed to read matrix: {}", e);
                None
            }
        }
    }

    pub fn get_column(&self, m: LibraryMatrix, column: usize) -> Option<Vec<f64>> {
        let result = if self.npy_path(m).exists() {
            npy::load_column(&self.npy_path(m), column).map(Some)
        } else if self.npz_path(m).exists() {
            npz::Archive::open(&self.npz_path(m)).and_then(|archive| {
                match archive.column(m.name(), column)? {
                    Some(values) => Ok(Some(values)),
                    None => match archive.names().first() {
                        Some(first) => archive.column(first, column),
                        None => Ok(None),
                    },
                }
            })
        } else {
            Ok(None)
        };
        match result {
            Ok(values) => values,
            Err(e) => {
                error!(folder = %self.folder.display(), matrix = m.name(), column, "failed to read column: {}", e);
                None
            }
        }
    }

    /// The providers of the library in matrix order, or an empty list when
    /// any entry of `index_A.json` cannot be resolved in the store.
    pub fn sync_products(&self, store: &dyn Store) -> Vec<ProcessProduct> {
        match self.try_sync_products(store) {
            Ok(products) => products,
            Err(e) => {
                debug!(folder = %self.folder.display(), "product index not usable: {}", e);
                Vec::new()
            }
        }
    }

    fn try_sync_products(&self, store: &dyn Store) -> Result<Vec<ProcessProduct>> {
        let entries = self.read_index("index_A.json")?;
        let processes = ids_by_ref(store.descriptors(ModelType::Process)?);
        let flows = ids_by_ref(store.descriptors(ModelType::Flow)?);

        let mut index = Vec::with_capacity(entries.len());
        for entry in &entries {
            let obj = entry.as_object().ok_or_else(|| self.mismatch("index entry is not an object"))?;
            let process = ref_id(obj, "process").and_then(|id| processes.get(id));
            let flow = ref_id(obj, "flow").and_then(|id| flows.get(id));
            match (process, flow) {
                (Some(process), Some(flow)) => index.push(ProcessProduct::of(*process, *flow)),
                _ => return Err(self.mismatch(format!("unresolved provider {}", entry))),
            }
        }
        Ok(index)
    }

    /// The elementary flows of the library in matrix order, or an empty list
    /// when any entry of `index_B.json` cannot be resolved in the store.
    pub fn sync_elementary_flows(&self, store: &dyn Store) -> Vec<IndexFlow> {
        match self.try_sync_elementary_flows(store) {
            Ok(flows) => flows,
            Err(e) => {
                debug!(folder = %self.folder.display(), "flow index not usable: {}", e);
                Vec::new()
            }
        }
    }

    fn try_sync_elementary_flows(&self, store: &dyn Store) -> Result<Vec<IndexFlow>> {
        let entries = self.read_index("index_B.json")?;
        let flows = ids_by_ref(store.descriptors(ModelType::Flow)?);
        let locations = ids_by_ref(store.descriptors(ModelType::Location)?);

        let mut index = Vec::with_capacity(entries.len());
        for entry in &entries {
            let obj = entry.as_object().ok_or_else(|| self.mismatch("index entry is not an object"))?;
            let flow = ref_id(obj, "flow")
                .and_then(|id| flows.get(id))
                .ok_or_else(|| self.mismatch(format!("unresolved flow {}", entry)))?;
            let is_input = obj.get("isInput").and_then(Value::as_bool).unwrap_or(false);
            let location = match ref_id(obj, "location") {
                Some(id) => Some(
                    *locations
                        .get(id)
                        .ok_or_else(|| self.mismatch(format!("unresolved location {}", id)))?,
                ),
                None => None,
            };
            let flow = if is_input { IndexFlow::input(*flow) } else { IndexFlow::output(*flow) };
            index.push(flow.at(location));
        }
        Ok(index)
    }

    /// Matrix position of `product`, if it is part of this library.
    pub fn index_of(&self, product: &ProcessProduct, store: &dyn Store) -> Option<usize> {
        self.sync_products(store).iter().position(|p| p == product)
    }

    /// Exchanges of a library provider, rebuilt from its columns in `A` and
    /// `B`. Amounts are in reference units; product inputs carry the
    /// supplying process as default provider.
    pub fn exchanges(&self, product: &ProcessProduct, store: &dyn Store) -> Vec<CalcExchange> {
        let products = self.sync_products(store);
        let Some(j) = products.iter().position(|p| p == product) else {
            return Vec::new();
        };
        let Some(a) = self.get_column(LibraryMatrix::A, j) else {
            return Vec::new();
        };
        if a.len() != products.len() {
            error!(folder = %self.folder.display(), "column of A does not match the product index");
            return Vec::new();
        }

        let exchange = |flow_id: i64, amount: f64, is_input: bool, is_elementary: bool| CalcExchange {
            id: 0,
            process_id: product.process_id,
            flow_id,
            amount,
            conversion_factor: 1.0,
            is_input,
            is_elementary,
            location_id: None,
            default_provider_id: None,
        };

        let mut exchanges = Vec::new();
        for (i, value) in a.iter().enumerate() {
            if *value == 0.0 {
                continue;
            }
            let provider = products[i];
            if i == j {
                exchanges.push(exchange(provider.flow_id, *value, false, false));
            } else {
                exchanges.push(CalcExchange {
                    default_provider_id: Some(provider.process_id),
                    ..exchange(provider.flow_id, -*value, true, false)
                });
            }
        }

        let flows = match self.elementary_flows(store) {
            Ok(flows) => flows,
            Err(e) => {
                debug!(folder = %self.folder.display(), "flow index not usable: {}", e);
                return Vec::new();
            }
        };
        if flows.is_empty() {
            return exchanges;
        }
        if let Some(b) = self.get_column(LibraryMatrix::B, j) {
            for (flow, value) in flows.iter().zip(b) {
                if value == 0.0 {
                    continue;
                }
                let amount = if flow.is_input { -value } else { value };
                exchanges.push(CalcExchange {
                    location_id: flow.location_id,
                    ..exchange(flow.flow_id, amount, flow.is_input, true)
                });
            }
        }
        exchanges
    }

    /// The matrices of the library as an inventory with `demand` on its
    /// first provider.
    pub fn inventory(&self, store: &dyn Store, demand: f64) -> Result<Inventory> {
        let products = self.sync_products(store);
        if products.is_empty() {
            return Err(self.mismatch("the product index does not match the store"));
        }
        let flows = self.elementary_flows(store)?;
        let technology = self
            .get_matrix(LibraryMatrix::A)
            .ok_or_else(|| self.mismatch("no readable technology matrix"))?;
        let intervention = if flows.is_empty() {
            Matrix::zeros(0, products.len())
        } else {
            self.get_matrix(LibraryMatrix::B)
                .ok_or_else(|| self.mismatch("no readable intervention matrix"))?
        };
        let tech_index = TechIndex::from_providers(products, demand)?;
        Inventory::from_matrices(tech_index, FlowIndex::from_flows(flows), technology, intervention)
    }

    /// Like [`Library::try_sync_elementary_flows`] but a library without
    /// `index_B.json` simply has no elementary flows.
    fn elementary_flows(&self, store: &dyn Store) -> Result<Vec<IndexFlow>> {
        if !self.folder.join("index_B.json").exists() {
            return Ok(Vec::new());
        }
        self.try_sync_elementary_flows(store)
    }

    fn read_index(&self, file: &str) -> Result<Vec<Value>> {
        let text = fs::read_to_string(self.folder.join(file))?;
        match serde_json::from_str(&text)? {
            Value::Array(entries) => Ok(entries),
            _ => Err(self.mismatch(format!("{} is not an array", file))),
        }
    }

    fn mismatch(&self, reason: impl Into<String>) -> CalcError {
        CalcError::LibraryMismatch {
            library: self.folder.display().to_string(),
            reason: reason.into(),
        }
    }

    fn npy_path(&self, m: LibraryMatrix) -> PathBuf {
        self.folder.join(format!("{}.npy", m.name()))
    }

    fn npz_path(&self, m: LibraryMatrix) -> PathBuf {
        self.folder.join(format!("{}.npz", m.name()))
    }
}

fn ids_by_ref(descriptors: Vec<Descriptor>) -> HashMap<String, i64> {
    descriptors.into_iter().map(|d| (d.ref_id, d.id)).collect()
}

/// Reads `{"@id": ...}` references as well as plain strings.
fn ref_id<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Option<&'a str> {
    match obj.get(field)? {
        Value::String(id) => Some(id.as_str()),
        Value::Object(reference) => reference.get("@id").and_then(Value::as_str),
        _ => None,
    }
}

/// Writes the matrices and indices of `inventory` as a library into `folder`.
pub fn write_library(folder: &Path, info: &LibraryInfo, inventory: &Inventory, store: &dyn Store) -> Result<Library> {
    let mismatch = |reason: String| CalcError::LibraryMismatch {
        library: folder.display().to_string(),
        reason,
    };
    let processes = refs_by_id(store.descriptors(ModelType::Process)?);
    let flows = refs_by_id(store.descriptors(ModelType::Flow)?);
    let locations = refs_by_id(store.descriptors(ModelType::Location)?);

    let mut products = Vec::with_capacity(inventory.tech_index.size());
    for p in inventory.tech_index.providers() {
        let process = processes
            .get(&p.process_id)
            .ok_or_else(|| mismatch(format!("process {} is not in the store", p.process_id)))?;
        let flow = flows
            .get(&p.flow_id)
            .ok_or_else(|| mismatch(format!("flow {} is not in the store", p.flow_id)))?;
        products.push(ProductEntry { process, flow });
    }

    let mut elementary = Vec::with_capacity(inventory.flow_index.size());
    for f in inventory.flow_index.flows() {
        let flow = flows
            .get(&f.flow_id)
            .ok_or_else(|| mismatch(format!("flow {} is not in the store", f.flow_id)))?;
        let location = match f.location_id {
            Some(id) => Some(
                locations
                    .get(&id)
                    .ok_or_else(|| mismatch(format!("location {} is not in the store", id)))?
                    .as_str(),
            ),
            None => None,
        };
        elementary.push(FlowEntry { flow, is_input: f.is_input, location });
    }

    fs::create_dir_all(folder)?;
    fs::write(folder.join("library.json"), serde_json::to_string_pretty(info)?)?;
    fs::write(folder.join("index_A.json"), serde_json::to_string_pretty(&products)?)?;
    fs::write(folder.join("index_B.json"), serde_json::to_string_pretty(&elementary)?)?;
    npy::write(&folder.join("A.npy"), &inventory.technology.to_dense())?;
    npy::write(&folder.join("B.npy"), &inventory.intervention.to_dense())?;

    info!(
        folder = %folder.display(),
        providers = products.len(),
        flows = elementary.len(),
        "wrote library"
    );
    Ok(Library::new(folder))
}

fn refs_by_id(descriptors: Vec<Descriptor>) -> HashMap<i64, String> {
    descriptors.into_iter().map(|d| (d.id, d.ref_id)).collect()
}

/// Finds library folders, i.e. folders with a `library.json`, below `root`.
pub fn discover(root: &Path) -> Vec<Library> {
    let mut libraries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() == "library.json" {
            if let Some(folder) = entry.path().parent() {
                libraries.push(Library::new(folder));
            }
        }
    }
    libraries.sort_by(|a, b| a.folder.cmp(&b.folder));
    libraries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, SqliteStore};
    use crate::models::FlowType;

    fn descriptor(id: i64, ref_id: &str) -> Descriptor {
        Descriptor { id, ref_id: ref_id.to_string(), name: ref_id.to_string() }
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store
            .with_connection(|conn| {
                db::insert_process(conn, &descriptor(1, "proc-1"))?;
                db::insert_process(conn, &descriptor(2, "proc-2"))?;
                db::insert_flow(conn, &descriptor(10, "prod-10"), FlowType::Product)?;
                db::insert_flow(conn, &descriptor(20, "prod-20"), FlowType::Product)?;
                db::insert_flow(conn, &descriptor(100, "co2"), FlowType::Elementary)?;
                db::insert_location(conn, &descriptor(7, "loc-de"))?;
                Ok(())
            })
            .unwrap();
        store
    }

    fn write_json(dir: &Path, file: &str, json: &str) {
        fs::write(dir.join(file), json).unwrap();
    }

    #[test]
    fn syncs_indices_by_reference_id() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            dir.path(),
            "index_A.json",
            r#"[{"process": "proc-2", "flow": "prod-20"}, {"process": {"@id": "proc-1"}, "flow": "prod-10"}]"#,
        );
        write_json(
            dir.path(),
            "index_B.json",
            r#"[{"flow": "co2"}, {"flow": "co2", "isInput": true, "location": "loc-de"}]"#,
        );
        let library = Library::new(dir.path());
        let store = store();
        assert_eq!(
            library.sync_products(&store),
            vec![ProcessProduct::of(2, 20), ProcessProduct::of(1, 10)]
        );
        assert_eq!(
            library.sync_elementary_flows(&store),
            vec![IndexFlow::output(100), IndexFlow::input(100).at(Some(7))]
        );
        assert_eq!(library.index_of(&ProcessProduct::of(1, 10), &store), Some(1));
        assert_eq!(library.index_of(&ProcessProduct::of(1, 20), &store), None);
    }

    #[test]
    fn unknown_reference_voids_the_whole_index() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            dir.path(),
            "index_A.json",
            r#"[{"process": "proc-1", "flow": "prod-10"}, {"process": "proc-9", "flow": "prod-10"}]"#,
        );
        write_json(dir.path(), "index_B.json", r#"[{"flow": "co2"}, {"flow": "co2", "location": "loc-xx"}]"#);
        let library = Library::new(dir.path());
        let store = store();
        assert!(library.sync_products(&store).is_empty());
        assert!(library.sync_elementary_flows(&store).is_empty());
    }

    #[test]
    fn malformed_entries_void_the_index() {
        let dir = tempfile::tempdir().unwrap();
        write_json(dir.path(), "index_A.json", r#"[{"process": "proc-1", "flow": "prod-10"}, 42]"#);
        write_json(dir.path(), "index_B.json", r#"{"flow": "co2"}"#);
        let library = Library::new(dir.path());
        let store = store();
        assert!(library.sync_products(&store).is_empty());
        assert!(library.sync_elementary_flows(&store).is_empty());
    }

    #[test]
    fn missing_files_are_absent_matrices() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::new(dir.path());
        assert!(!library.has_matrix(LibraryMatrix::A));
        assert!(library.get_matrix(LibraryMatrix::A).is_none());
        assert!(library.get_column(LibraryMatrix::A, 0).is_none());
        assert!(library.sync_products(&store()).is_empty());
        assert!(library.info().is_err());

        fs::write(dir.path().join("A.npy"), b"garbage").unwrap();
        assert!(library.has_matrix(LibraryMatrix::A));
        assert!(library.get_matrix(LibraryMatrix::A).is_none());
    }

    #[test]
    fn oversized_matrix_header_is_an_absent_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let dict = "{'descr': '<f8', 'fortran_order': True, 'shape': (4000000000, 4000000000), }\n";
        let mut buf = Vec::new();
        buf.extend_from_slice(&npy::MAGIC);
        buf.extend_from_slice(&[1, 0]);
        buf.extend_from_slice(&(dict.len() as u16).to_le_bytes());
        buf.extend_from_slice(dict.as_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        fs::write(dir.path().join("A.npy"), &buf).unwrap();

        let library = Library::new(dir.path());
        assert!(library.has_matrix(LibraryMatrix::A));
        assert!(library.get_matrix(LibraryMatrix::A).is_none());
        assert!(library.get_column(LibraryMatrix::A, 3).is_none());
    }

    fn two_provider_library(dir: &Path, flow_index: Option<&str>) -> Library {
        write_json(
            dir,
            "index_A.json",
            r#"[{"process": "proc-1", "flow": "prod-10"}, {"process": "proc-2", "flow": "prod-20"}]"#,
        );
        let a = nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 0.0, -0.5, 1.0]);
        npy::write(&dir.join("A.npy"), &a).unwrap();
        if let Some(json) = flow_index {
            write_json(dir, "index_B.json", json);
            let b = nalgebra::DMatrix::from_row_slice(1, 2, &[0.0, 2.0]);
            npy::write(&dir.join("B.npy"), &b).unwrap();
        }
        Library::new(dir)
    }

    #[test]
    fn unresolved_flow_index_fails_the_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let library = two_provider_library(dir.path(), Some(r#"[{"flow": "unknown-flow"}]"#));
        let store = store();
        assert!(matches!(
            library.inventory(&store, 1.0),
            Err(CalcError::LibraryMismatch { .. })
        ));
        assert!(library.exchanges(&ProcessProduct::of(2, 20), &store).is_empty());
    }

    #[test]
    fn library_without_flow_index_has_no_flows() {
        let store = store();
        for flow_index in [None, Some("[]")] {
            let dir = tempfile::tempdir().unwrap();
            let library = two_provider_library(dir.path(), flow_index);
            let inventory = library.inventory(&store, 1.0).unwrap();
            assert_eq!(inventory.intervention.rows(), 0);
            assert_eq!(inventory.intervention.cols(), 2);
            let exchanges = library.exchanges(&ProcessProduct::of(1, 10), &store);
            assert_eq!(exchanges.len(), 2);
            assert!(exchanges.iter().all(|e| !e.is_elementary));
        }
    }

    #[test]
    fn resolved_flow_index_gives_elementary_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let library = two_provider_library(dir.path(), Some(r#"[{"flow": "co2"}]"#));
        let store = store();
        let inventory = library.inventory(&store, 1.0).unwrap();
        assert_eq!(inventory.flow_index.flows(), &[IndexFlow::output(100)]);
        let exchanges = library.exchanges(&ProcessProduct::of(2, 20), &store);
        let co2 = exchanges.iter().find(|e| e.is_elementary).unwrap();
        assert_eq!(co2.amount, 2.0);
    }

    #[test]
    fn falls_back_to_npz() {
        let dir = tempfile::tempdir().unwrap();
        let m = nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 0.0, -3.0, 1.0]);
        npz::write(&dir.path().join("A.npz"), &[("arr_0", &m)]).unwrap();
        let library = Library::new(dir.path());
        assert!(library.has_matrix(LibraryMatrix::A));
        assert_eq!(library.get_matrix(LibraryMatrix::A).unwrap().get(1, 0), -3.0);
        assert_eq!(library.get_column(LibraryMatrix::A, 0).unwrap(), vec![1.0, -3.0]);
    }

    #[test]
    fn discovers_library_folders() {
        let root = tempfile::tempdir().unwrap();
        for name in ["b", "a/nested"] {
            let folder = root.path().join(name);
            fs::create_dir_all(&folder).unwrap();
            fs::write(
                folder.join("library.json"),
                serde_json::to_string(&LibraryInfo::new(name, "1.0")).unwrap(),
            )
            .unwrap();
        }
        fs::create_dir_all(root.path().join("empty")).unwrap();
        let found = discover(root.path());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].info().unwrap().name, "a/nested");
        assert_eq!(found[1].info().unwrap().version, "1.0");
    }
}
