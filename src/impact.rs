//! Characterization factor matrix of an impact assessment method

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::cache::MatrixCache;
use crate::error::Result;
use crate::index::FlowIndex;
use crate::matrix::{Matrix, MatrixBuilder};
use crate::models::{Descriptor, ImpactFactor};

/// Impact categories × elementary flows.
#[derive(Debug, Clone)]
pub struct ImpactTable {
    pub categories: Vec<Descriptor>,
    pub factors: Matrix,
}

impl ImpactTable {
    pub fn build(cache: &MatrixCache, method_id: i64, flow_index: &FlowIndex) -> Result<Self> {
        let categories = cache.store().impact_categories(method_id)?;
        Ok(Self::for_categories(cache, categories, flow_index))
    }

    pub fn for_categories(cache: &MatrixCache, categories: Vec<Descriptor>, flow_index: &FlowIndex) -> Self {
        let ids: Vec<i64> = categories.iter().map(|c| c.id).collect();
        let factors = cache.impact_factors().get_all(&ids);

        let mut builder = MatrixBuilder::new(categories.len(), flow_index.size());
        for (row, category) in categories.iter().enumerate() {
            let by_flow = factors_by_flow(&factors[&category.id]);
            for (col, flow) in flow_index.flows().iter().enumerate() {
                let factor = flow
                    .location_id
                    .and_then(|loc| by_flow.get(&(flow.flow_id, Some(loc))))
                    .or_else(|| by_flow.get(&(flow.flow_id, None)));
                let Some(factor) = factor else {
                    continue;
                };
                if factor.formula.is_some() {
                    trace!(
                        category = category.id,
                        flow = flow.flow_id,
                        "factor has a formula; using its stored value"
                    );
                }
                // inputs are negative in the intervention matrix
                let value = if flow.is_input { -factor.value() } else { factor.value() };
                builder.set(row, col, value);
            }
        }

        debug!(categories = categories.len(), flows = flow_index.size(), "built impact table");
        Self { categories, factors: builder.finish() }
    }

    pub fn index_of(&self, category_id: i64) -> Option<usize> {
        self.categories.iter().position(|c| c.id == category_id)
    }
}

fn factors_by_flow(factors: &[ImpactFactor]) -> HashMap<(i64, Option<i64>), &ImpactFactor> {
    let mut map = HashMap::new();
    for f in factors {
        map.entry((f.flow_id, f.location_id)).or_insert(f);
    }
    map
}
