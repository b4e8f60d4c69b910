//! Assembly of the technology and intervention matrices

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::allocation::AllocationMethod;
use crate::cache::MatrixCache;
use crate::error::{CalcError, DataWarning, Result};
use crate::index::{FlowIndex, TechIndex};
use crate::matrix::{Matrix, MatrixBuilder};

/// The matrices of one calculation. Owned by that calculation.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub tech_index: TechIndex,
    pub flow_index: FlowIndex,
    pub allocation: AllocationMethod,
    /// Providers × providers; outputs positive, inputs negative.
    pub technology: Matrix,
    /// Elementary flows × providers; outputs positive, inputs negative.
    pub intervention: Matrix,
    pub warnings: Vec<DataWarning>,
}

impl Inventory {
    /// Wraps matrices from another source, e.g. a library.
    pub fn from_matrices(
        tech_index: TechIndex,
        flow_index: FlowIndex,
        technology: Matrix,
        intervention: Matrix,
    ) -> Result<Self> {
        let n = tech_index.size();
        if technology.rows() != n || technology.cols() != n {
            return Err(CalcError::DimensionMismatch { expected: n, actual: technology.cols() });
        }
        if intervention.rows() != flow_index.size() {
            return Err(CalcError::DimensionMismatch {
                expected: flow_index.size(),
                actual: intervention.rows(),
            });
        }
        if intervention.cols() != n {
            return Err(CalcError::DimensionMismatch { expected: n, actual: intervention.cols() });
        }
        Ok(Self {
            tech_index,
            flow_index,
            allocation: AllocationMethod::None,
            technology,
            intervention,
            warnings: Vec::new(),
        })
    }
}

pub struct InventoryBuilder<'a> {
    cache: &'a MatrixCache,
    allocation: AllocationMethod,
    regionalized: bool,
}

impl<'a> InventoryBuilder<'a> {
    pub fn new(cache: &'a MatrixCache, allocation: AllocationMethod) -> Self {
        Self { cache, allocation, regionalized: false }
    }

    pub fn regionalized(mut self, regionalized: bool) -> Self {
        self.regionalized = regionalized;
        self
    }

    pub fn build(&self, tech_index: TechIndex) -> Inventory {
        let flow_index = FlowIndex::build(&tech_index, self.cache, self.regionalized);
        let process_ids = tech_index.process_ids();
        let exchanges = self.cache.exchanges().get_all(&process_ids);
        let factors = if self.allocation == AllocationMethod::None {
            Default::default()
        } else {
            self.cache.allocation_factors().get_all(&process_ids)
        };

        let n = tech_index.size();
        let mut technology = MatrixBuilder::new(n, n);
        let mut intervention = MatrixBuilder::new(flow_index.size(), n);
        let mut warnings = Vec::new();
        let mut missing_processes = HashSet::new();

        for (j, provider) in tech_index.providers().iter().enumerate() {
            let process_exchanges = &exchanges[&provider.process_id];
            if process_exchanges.is_empty() {
                if missing_processes.insert(provider.process_id) {
                    warn!(process = provider.process_id, "process has no exchanges; its column stays zero");
                    warnings.push(DataWarning::MissingProcess { process_id: provider.process_id });
                }
                continue;
            }

            let process_factors = factors
                .get(&provider.process_id)
                .map(|f| f.as_slice())
                .unwrap_or(&[]);
            let column = self
                .allocation
                .allocate(provider.flow_id, process_exchanges, process_factors);

            let mut has_product = false;
            for (e, factor) in column {
                let amount = e.converted_amount() * factor;
                if e.is_product_output() {
                    has_product = true;
                    technology.add(j, j, amount);
                } else if e.is_product_input() {
                    let Some(supplier) = tech_index.linked_provider(e.process_id, e.flow_id) else {
                        // unlinked inputs are cut off
                        continue;
                    };
                    if let Some(i) = tech_index.index_of(&supplier) {
                        technology.add(i, j, -amount);
                    }
                } else {
                    let location = if self.regionalized { e.location_id } else { None };
                    if let Some(row) = flow_index.index_of(e.flow_id, location) {
                        let value = if e.is_input { -amount } else { amount };
                        intervention.add(row, j, value);
                    }
                }
            }

            if !has_product {
                warn!(
                    process = provider.process_id,
                    product = provider.flow_id,
                    "provider has no reference output; its column stays zero"
                );
                technology.clear_column(j);
                intervention.clear_column(j);
                warnings.push(DataWarning::MissingProduct {
                    process_id: provider.process_id,
                    flow_id: provider.flow_id,
                });
            }
        }

        debug!(
            providers = n,
            flows = flow_index.size(),
            warnings = warnings.len(),
            "assembled inventory matrices"
        );
        Inventory {
            tech_index,
            flow_index,
            allocation: self.allocation,
            technology: technology.finish(),
            intervention: intervention.finish(),
            warnings,
        }
    }
}
