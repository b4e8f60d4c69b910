//! Calculation of inventory and impact results

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::cache::MatrixCache;
use crate::contribution::{ContributionTree, TreeOptions};
use crate::db::Store;
use crate::error::{CalcError, DataWarning, Result};
use crate::impact::ImpactTable;
use crate::index::ProductIndex;
use crate::inventory::{Inventory, InventoryBuilder};
use crate::models::{Descriptor, ModelType, ProcessProduct};
use crate::setup::CalculationSetup;
use crate::solver::LinearSolver;

/// Results of solving one inventory.
#[derive(Debug, Clone)]
pub struct SimpleResult {
    pub inventory: Inventory,
    pub impacts: Option<ImpactTable>,
    /// Scaling factor of each provider, `A s = f`.
    pub scaling: Vec<f64>,
    /// Output of each provider's reference product, `diag(A) * s`.
    pub total_requirements: Vec<f64>,
    /// Total amount of each elementary flow, `B s`.
    pub flow_results: Vec<f64>,
    /// Total result of each impact category, `C g`.
    pub impact_results: Vec<f64>,
    pub warnings: Vec<DataWarning>,
    solver: LinearSolver,
}

/// Calculates the product system named by `setup`.
pub fn calculate(cache: &MatrixCache, setup: &CalculationSetup) -> Result<SimpleResult> {
    calculate_with_abort(cache, setup, &|| false)
}

/// Like [`calculate`]; `abort` is polled while large systems are solved.
pub fn calculate_with_abort(
    cache: &MatrixCache,
    setup: &CalculationSetup,
    abort: &dyn Fn() -> bool,
) -> Result<SimpleResult> {
    let inventory = build_inventory(cache, setup)?;
    let impacts = match setup.impact_method_id {
        Some(method_id) => Some(ImpactTable::build(cache, method_id, &inventory.flow_index)?),
        None => None,
    };

    let solver = LinearSolver::new(setup.solver.clone());
    let process_ids = inventory.tech_index.process_ids();
    let category_ids: Vec<i64> = impacts
        .as_ref()
        .map(|table| table.categories.iter().map(|c| c.id).collect())
        .unwrap_or_default();
    let mut result = SimpleResult::of(inventory, impacts, &solver, abort)?;
    result.warnings.extend(cache.failures_for(&process_ids, &category_ids));
    Ok(result)
}

/// Assembles the matrices of the product system named by `setup`.
pub fn build_inventory(cache: &MatrixCache, setup: &CalculationSetup) -> Result<Inventory> {
    let system = cache
        .store()
        .product_system(setup.product_system_id)?
        .ok_or_else(|| {
            CalcError::InvalidInput(format!("product system {} does not exist", setup.product_system_id))
        })?;

    let mut index = ProductIndex::from_system(&system);
    if let Some(amount) = setup.amount {
        index.set_demand(amount);
    }
    let tech_index = index.freeze();
    info!(
        system = system.id,
        providers = tech_index.size(),
        allocation = setup.allocation.as_str(),
        "building inventory"
    );

    Ok(InventoryBuilder::new(cache, setup.allocation)
        .regionalized(setup.regionalized)
        .build(tech_index))
}

impl SimpleResult {
    /// Solves an assembled inventory, e.g. one read from a library.
    pub fn of(
        inventory: Inventory,
        impacts: Option<ImpactTable>,
        solver: &LinearSolver,
        abort: &dyn Fn() -> bool,
    ) -> Result<Self> {
        let n = inventory.tech_index.size();
        let demand = inventory.tech_index.demand_vector();
        let scaling = solver.solve_with_abort(&inventory.technology, &demand, abort)?;
        if scaling.iter().any(|s| !s.is_finite()) {
            return Err(CalcError::Unsolvable {
                size: n,
                reason: "the scaling vector is not finite".to_string(),
            });
        }

        let total_requirements = inventory
            .technology
            .diagonal()
            .iter()
            .zip(&scaling)
            .map(|(a, s)| a * s)
            .collect();
        let flow_results = inventory.intervention.multiply(&scaling)?;
        let impact_results = match &impacts {
            Some(table) => table.factors.multiply(&flow_results)?,
            None => Vec::new(),
        };

        for w in &inventory.warnings {
            warn!("{}", w);
        }
        debug!(
            providers = n,
            flows = flow_results.len(),
            impacts = impact_results.len(),
            "solved inventory"
        );
        let warnings = inventory.warnings.clone();
        Ok(Self {
            inventory,
            impacts,
            scaling,
            total_requirements,
            flow_results,
            impact_results,
            warnings,
            solver: solver.clone(),
        })
    }

    pub fn scaling_factor(&self, provider: &ProcessProduct) -> Option<f64> {
        self.inventory.tech_index.index_of(provider).map(|i| self.scaling[i])
    }

    pub fn total_requirement(&self, provider: &ProcessProduct) -> Option<f64> {
        self.inventory
            .tech_index
            .index_of(provider)
            .map(|i| self.total_requirements[i])
    }

    /// Net total of an elementary flow in the direction of its index entry:
    /// consumption for inputs, emission for outputs.
    pub fn flow_result(&self, flow_id: i64, location_id: Option<i64>) -> Option<f64> {
        let pos = self.inventory.flow_index.index_of(flow_id, location_id)?;
        let value = self.flow_results[pos];
        Some(if self.inventory.flow_index.is_input(pos) { -value } else { value })
    }

    pub fn impact_result(&self, category_id: i64) -> Option<f64> {
        let pos = self.impacts.as_ref()?.index_of(category_id)?;
        Some(self.impact_results[pos])
    }

    pub fn flow_tree(&self, flow_id: i64, location_id: Option<i64>, options: &TreeOptions) -> Result<ContributionTree> {
        let pos = self
            .inventory
            .flow_index
            .index_of(flow_id, location_id)
            .ok_or_else(|| CalcError::InvalidInput(format!("flow {} is not in the result", flow_id)))?;
        ContributionTree::for_flow(&self.inventory, pos, &self.solver, options)
    }

    pub fn impact_tree(&self, category_id: i64, options: &TreeOptions) -> Result<ContributionTree> {
        let table = self
            .impacts
            .as_ref()
            .ok_or_else(|| CalcError::InvalidInput("the result has no impact results".to_string()))?;
        let pos = table
            .index_of(category_id)
            .ok_or_else(|| CalcError::InvalidInput(format!("impact category {} is not in the result", category_id)))?;
        ContributionTree::for_impact(&self.inventory, table, pos, &self.solver, options)
    }
}

/// Summary of a calculation with names resolved from the store
#[derive(Debug)]
pub struct ResultSummary {
    pub reference: String,
    pub demand: f64,
    pub providers: Vec<(String, f64)>,
    pub flows: Vec<(String, f64)>,
    pub impacts: Vec<(String, f64)>,
    pub warnings: usize,
}

/// Generate a summary of a result
pub fn summarize(result: &SimpleResult, store: &dyn Store) -> Result<ResultSummary> {
    let processes = names(store.descriptors(ModelType::Process)?);
    let flows = names(store.descriptors(ModelType::Flow)?);
    let label = |id: i64, names: &HashMap<i64, String>| names.get(&id).cloned().unwrap_or_else(|| format!("#{}", id));

    let index = &result.inventory.tech_index;
    let reference = index.reference();
    let providers = index
        .providers()
        .iter()
        .zip(&result.total_requirements)
        .map(|(p, amount)| (format!("{} | {}", label(p.process_id, &processes), label(p.flow_id, &flows)), *amount))
        .collect();

    let mut flow_list: Vec<(String, f64)> = result
        .inventory
        .flow_index
        .flows()
        .iter()
        .enumerate()
        .filter_map(|(pos, f)| {
            let amount = result.flow_result(f.flow_id, f.location_id)?;
            let direction = if result.inventory.flow_index.is_input(pos) { "in" } else { "out" };
            Some((format!("{} ({})", label(f.flow_id, &flows), direction), amount))
        })
        .collect();
    flow_list.sort_by(|a, b| a.0.cmp(&b.0));

    let impacts = match &result.impacts {
        Some(table) => table
            .categories
            .iter()
            .zip(&result.impact_results)
            .map(|(c, v)| (c.name.clone(), *v))
            .collect(),
        None => Vec::new(),
    };

    Ok(ResultSummary {
        reference: format!(
            "{} | {}",
            label(reference.process_id, &processes),
            label(reference.flow_id, &flows)
        ),
        demand: index.demand(),
        providers,
        flows: flow_list,
        impacts,
        warnings: result.warnings.len(),
    })
}

fn names(descriptors: Vec<Descriptor>) -> HashMap<i64, String> {
    descriptors.into_iter().map(|d| (d.id, d.name)).collect()
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Calculation Summary ===")?;
        writeln!(f, "Reference: {} @ {:.4}", self.reference, self.demand)?;
        writeln!(f)?;

        writeln!(f, "Total requirements:")?;
        for (name, amount) in &self.providers {
            writeln!(f, "  {:>14.6e}  {}", amount, name)?;
        }
        writeln!(f)?;

        writeln!(f, "Elementary flows:")?;
        for (name, amount) in &self.flows {
            writeln!(f, "  {:>14.6e}  {}", amount, name)?;
        }

        if !self.impacts.is_empty() {
            writeln!(f)?;
            writeln!(f, "Impacts:")?;
            for (name, amount) in &self.impacts {
                writeln!(f, "  {:>14.6e}  {}", amount, name)?;
            }
        }

        if self.warnings > 0 {
            writeln!(f)?;
            writeln!(f, "{} data warnings; see the log for details", self.warnings)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FlowIndex, TechIndex};
    use crate::matrix::Matrix;
    use crate::models::IndexFlow;
    use approx::assert_relative_eq;

    fn inventory() -> Inventory {
        let index = TechIndex::from_providers(vec![ProcessProduct::of(1, 10), ProcessProduct::of(2, 20)], 2.0).unwrap();
        Inventory::from_matrices(
            index,
            FlowIndex::from_flows([IndexFlow::output(100), IndexFlow::input(101)]),
            Matrix::from_rows(&[vec![1.0, 0.0], vec![-0.5, 2.0]]),
            Matrix::from_rows(&[vec![1.0, 4.0], vec![0.0, -1.0]]),
        )
        .unwrap()
    }

    #[test]
    fn solves_scaling_and_flows() {
        let r = SimpleResult::of(inventory(), None, &LinearSolver::default(), &|| false).unwrap();
        // s = [2, 0.5]
        assert_relative_eq!(r.scaling[0], 2.0);
        assert_relative_eq!(r.scaling[1], 0.5);
        assert_relative_eq!(r.total_requirements[1], 1.0);
        assert_relative_eq!(r.flow_result(100, None).unwrap(), 4.0);
        // inputs are reported positive
        assert_relative_eq!(r.flow_result(101, None).unwrap(), 0.5);
        assert!(r.flow_result(999, None).is_none());
        assert!(r.impact_result(1).is_none());
        assert_relative_eq!(r.scaling_factor(&ProcessProduct::of(2, 20)).unwrap(), 0.5);
    }

    #[test]
    fn singular_system_is_reported() {
        let index = TechIndex::from_providers(vec![ProcessProduct::of(1, 10), ProcessProduct::of(2, 20)], 1.0).unwrap();
        let inv = Inventory::from_matrices(
            index,
            FlowIndex::new(),
            Matrix::from_rows(&[vec![1.0, 0.0], vec![-1.0, 0.0]]),
            Matrix::zeros(0, 2),
        )
        .unwrap();
        assert!(matches!(
            SimpleResult::of(inv, None, &LinearSolver::default(), &|| false),
            Err(CalcError::Unsolvable { .. })
        ));
    }

    #[test]
    fn impact_results_use_flow_results() {
        let inv = inventory();
        let table = ImpactTable {
            categories: vec![Descriptor { id: 7, ref_id: "gwp".to_string(), name: "GWP".to_string() }],
            // input factors are stored negated
            factors: Matrix::from_rows(&[vec![2.0, -3.0]]),
        };
        let r = SimpleResult::of(inv, Some(table), &LinearSolver::default(), &|| false).unwrap();
        // g = [4, -0.5]
        assert_relative_eq!(r.impact_result(7).unwrap(), 9.5);
        let tree = r.impact_tree(7, &TreeOptions::default()).unwrap();
        assert_relative_eq!(tree.root.amount, 9.5, epsilon = 1e-12);
        assert!(r.impact_tree(8, &TreeOptions::default()).is_err());
    }
}
