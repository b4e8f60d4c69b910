//! Matrix indices: the product graph of a system, its frozen provider index
//! and the elementary flow index

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::cache::MatrixCache;
use crate::error::{CalcError, Result};
use crate::models::{IndexFlow, ProcessLink, ProcessProduct, ProductSystem};

/// Recipient side of a link: `(process id, flow id)` of a product input.
pub type LinkKey = (i64, i64);

/// The product graph while it is traversed. Positions are assigned on first
/// visit; the reference provider is always at position 0.
#[derive(Debug, Clone)]
pub struct ProductIndex {
    demand: f64,
    providers: Vec<ProcessProduct>,
    positions: HashMap<ProcessProduct, usize>,
    links: Vec<(LinkKey, ProcessProduct)>,
    linked: HashMap<LinkKey, ProcessProduct>,
}

impl ProductIndex {
    pub fn new(reference: ProcessProduct, demand: f64) -> Self {
        let mut index = Self {
            demand,
            providers: Vec::new(),
            positions: HashMap::new(),
            links: Vec::new(),
            linked: HashMap::new(),
        };
        index.put(reference);
        index
    }

    /// Builds the index of a product system by a breadth-first traversal of
    /// its links starting at the reference process.
    pub fn from_system(system: &ProductSystem) -> Self {
        let mut by_recipient: HashMap<i64, Vec<&ProcessLink>> = HashMap::new();
        for link in &system.links {
            by_recipient.entry(link.process_id).or_default().push(link);
        }

        let mut index = ProductIndex::new(system.reference, system.target_amount);
        let mut visited: HashSet<i64> = HashSet::new();
        let mut queue = VecDeque::from([system.reference.process_id]);
        while let Some(process_id) = queue.pop_front() {
            if !visited.insert(process_id) {
                continue;
            }
            let Some(links) = by_recipient.get(&process_id) else {
                continue;
            };
            for link in links {
                let provider = ProcessProduct::of(link.provider_id, link.flow_id);
                index.put_link((process_id, link.flow_id), provider);
                if !visited.contains(&link.provider_id) {
                    queue.push_back(link.provider_id);
                }
            }
        }
        index
    }

    /// Adds the provider if it is not yet indexed and returns its position.
    pub fn put(&mut self, provider: ProcessProduct) -> usize {
        if let Some(pos) = self.positions.get(&provider) {
            return *pos;
        }
        let pos = self.providers.len();
        self.providers.push(provider);
        self.positions.insert(provider, pos);
        pos
    }

    /// Links a product input of a process to a provider. The first link of
    /// an input wins.
    pub fn put_link(&mut self, input: LinkKey, provider: ProcessProduct) {
        self.put(provider);
        if self.linked.contains_key(&input) {
            return;
        }
        self.linked.insert(input, provider);
        self.links.push((input, provider));
    }

    pub fn size(&self) -> usize {
        self.providers.len()
    }

    pub fn set_demand(&mut self, demand: f64) {
        self.demand = demand;
    }

    pub fn freeze(self) -> TechIndex {
        let mut by_recipient: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut seen = HashSet::new();
        for ((recipient, _), supplier) in &self.links {
            let supplier_pos = self.positions[supplier];
            if seen.insert((*recipient, supplier_pos)) {
                by_recipient.entry(*recipient).or_default().push(supplier_pos);
            }
        }
        let suppliers: Vec<Vec<usize>> = self
            .providers
            .iter()
            .enumerate()
            .map(|(pos, provider)| match by_recipient.get(&provider.process_id) {
                Some(list) => list.iter().copied().filter(|s| *s != pos).collect(),
                None => Vec::new(),
            })
            .collect();
        debug!(providers = self.providers.len(), links = self.links.len(), "froze product index");
        TechIndex {
            demand: self.demand,
            providers: self.providers,
            positions: self.positions,
            linked: self.linked,
            suppliers,
        }
    }
}

/// Frozen provider index: positions never change during a calculation.
#[derive(Debug, Clone)]
pub struct TechIndex {
    demand: f64,
    providers: Vec<ProcessProduct>,
    positions: HashMap<ProcessProduct, usize>,
    linked: HashMap<LinkKey, ProcessProduct>,
    suppliers: Vec<Vec<usize>>,
}

impl TechIndex {
    /// An index without link information, e.g. synced from a library.
    pub fn from_providers(providers: Vec<ProcessProduct>, demand: f64) -> Result<Self> {
        if providers.is_empty() {
            return Err(CalcError::InvalidInput("a provider index cannot be empty".to_string()));
        }
        let mut index = ProductIndex::new(providers[0], demand);
        for provider in providers.into_iter().skip(1) {
            index.put(provider);
        }
        Ok(index.freeze())
    }

    pub fn size(&self) -> usize {
        self.providers.len()
    }

    pub fn reference(&self) -> ProcessProduct {
        self.providers[0]
    }

    pub fn demand(&self) -> f64 {
        self.demand
    }

    pub fn provider_at(&self, pos: usize) -> ProcessProduct {
        self.providers[pos]
    }

    pub fn providers(&self) -> &[ProcessProduct] {
        &self.providers
    }

    pub fn index_of(&self, provider: &ProcessProduct) -> Option<usize> {
        self.positions.get(provider).copied()
    }

    /// The provider linked to the given product input of a process.
    pub fn linked_provider(&self, process_id: i64, flow_id: i64) -> Option<ProcessProduct> {
        self.linked.get(&(process_id, flow_id)).copied()
    }

    pub fn is_linked(&self, process_id: i64, flow_id: i64) -> bool {
        self.linked.contains_key(&(process_id, flow_id))
    }

    /// False for indices that were not built from a product graph.
    pub fn has_links(&self) -> bool {
        !self.linked.is_empty()
    }

    /// Positions of the direct suppliers of the provider at `pos`.
    pub fn suppliers(&self, pos: usize) -> &[usize] {
        &self.suppliers[pos]
    }

    /// Distinct process ids in index order.
    pub fn process_ids(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .map(|p| p.process_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// The demand vector: `demand` on the reference provider.
    pub fn demand_vector(&self) -> Vec<f64> {
        let mut v = vec![0.0; self.size()];
        v[0] = self.demand;
        v
    }
}

/// Ordered set of elementary flows; the row order of the intervention matrix.
#[derive(Debug, Clone, Default)]
pub struct FlowIndex {
    flows: Vec<IndexFlow>,
    positions: HashMap<(i64, Option<i64>), usize>,
}

impl FlowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flows(flows: impl IntoIterator<Item = IndexFlow>) -> Self {
        let mut index = Self::new();
        for flow in flows {
            index.put(flow);
        }
        index
    }

    /// Collects the elementary flows of all processes in the provider index.
    ///
    /// A flow gets one row per location. Its direction is taken from its
    /// first exchange in index order; exchanges in the other direction keep
    /// their own sign in the intervention matrix, so the result of the row is
    /// the net amount in the direction of the row.
    pub fn build(tech_index: &TechIndex, cache: &MatrixCache, regionalized: bool) -> Self {
        let process_ids = tech_index.process_ids();
        let exchanges = cache.exchanges().get_all(&process_ids);
        let mut index = Self::new();
        for process_id in &process_ids {
            for e in exchanges[process_id].iter().filter(|e| e.is_elementary) {
                let location = if regionalized { e.location_id } else { None };
                let flow = if e.is_input {
                    IndexFlow::input(e.flow_id)
                } else {
                    IndexFlow::output(e.flow_id)
                };
                index.put(flow.at(location));
            }
        }
        debug!(flows = index.size(), regionalized, "built flow index");
        index
    }

    /// Adds the flow if its `(flow, location)` key is new and returns its position.
    pub fn put(&mut self, flow: IndexFlow) -> usize {
        let key = (flow.flow_id, flow.location_id);
        if let Some(pos) = self.positions.get(&key) {
            return *pos;
        }
        let pos = self.flows.len();
        self.flows.push(flow);
        self.positions.insert(key, pos);
        pos
    }

    pub fn size(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn at(&self, pos: usize) -> IndexFlow {
        self.flows[pos]
    }

    pub fn flows(&self) -> &[IndexFlow] {
        &self.flows
    }

    pub fn index_of(&self, flow_id: i64, location_id: Option<i64>) -> Option<usize> {
        self.positions.get(&(flow_id, location_id)).copied()
    }

    pub fn is_input(&self, pos: usize) -> bool {
        self.flows[pos].is_input
    }
}

/// Builds a product system by linking every product input to a provider:
/// the default provider of the exchange when it produces the flow, else the
/// producing process with the lowest id. Inputs without producer stay open.
pub fn auto_link(cache: &MatrixCache, reference: ProcessProduct, amount: f64) -> Result<ProductSystem> {
    let store = cache.store();
    let mut producers: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut links = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([reference.process_id]);

    while let Some(process_id) = queue.pop_front() {
        if !visited.insert(process_id) {
            continue;
        }
        let exchanges = cache.exchanges().get(&process_id);
        for e in exchanges.iter().filter(|e| e.is_product_input()) {
            if !producers.contains_key(&e.flow_id) {
                producers.insert(e.flow_id, store.providers_of(e.flow_id)?);
            }
            let candidates = &producers[&e.flow_id];
            let provider = e
                .default_provider_id
                .filter(|id| candidates.contains(id))
                .or_else(|| candidates.first().copied());
            let Some(provider_id) = provider else {
                continue;
            };
            links.push(ProcessLink { provider_id, flow_id: e.flow_id, process_id });
            queue.push_back(provider_id);
        }
    }

    debug!(links = links.len(), processes = visited.len(), "linked product system");
    Ok(ProductSystem {
        id: 0,
        name: format!("auto-linked system of process {}", reference.process_id),
        reference,
        target_amount: amount,
        links,
    })
}
