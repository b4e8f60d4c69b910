//! Contribution trees: attribution of a total result along the supply chain
//!
//! For a tracked row `b` (the direct amount of a flow or impact per unit of
//! provider activity) the upstream intensities `u` solve `Aᵀ u = b`; `u[j]`
//! is the total result per unit of product `j`. A node that requires `r`
//! units of product `j` then carries `r * u[j]`, which splits into its direct
//! part `r / A[j][j] * b[j]` plus the amounts of its suppliers, where
//! supplier `i` is required with `r / A[j][j] * -A[i][j]`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalcError, Result};
use crate::impact::ImpactTable;
use crate::inventory::Inventory;
use crate::models::ProcessProduct;
use crate::solver::LinearSolver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Nodes at this depth are not expanded further.
    pub max_depth: Option<usize>,
    /// Suppliers whose amount is below this share of the root amount are
    /// left out.
    pub cutoff: f64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self { max_depth: None, cutoff: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContributionTreeNode {
    pub provider: ProcessProduct,
    pub position: usize,
    /// Amount of the provider's product required along this path.
    pub requirement: f64,
    /// Contribution of this node and its upstream chain.
    pub amount: f64,
    /// Contribution of the provider itself.
    pub direct: f64,
    /// Set when the provider is already on the path to the root and was
    /// not expanded again.
    pub cycle: bool,
    pub children: Vec<ContributionTreeNode>,
}

impl ContributionTreeNode {
    pub fn children_sum(&self) -> f64 {
        self.children.iter().map(|c| c.amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContributionTree {
    pub root: ContributionTreeNode,
}

impl ContributionTree {
    /// Tree for the elementary flow at `flow_pos` of the flow index.
    pub fn for_flow(
        inventory: &Inventory,
        flow_pos: usize,
        solver: &LinearSolver,
        options: &TreeOptions,
    ) -> Result<Self> {
        if flow_pos >= inventory.flow_index.size() {
            return Err(CalcError::InvalidInput(format!("no flow at position {}", flow_pos)));
        }
        let row = inventory.intervention.row(flow_pos);
        Self::build(inventory, &row, solver, options)
    }

    /// Tree for the impact category at `category_pos` of the impact table.
    pub fn for_impact(
        inventory: &Inventory,
        table: &ImpactTable,
        category_pos: usize,
        solver: &LinearSolver,
        options: &TreeOptions,
    ) -> Result<Self> {
        if category_pos >= table.categories.len() {
            return Err(CalcError::InvalidInput(format!(
                "no impact category at position {}",
                category_pos
            )));
        }
        let factors = table.factors.row(category_pos);
        let n = inventory.tech_index.size();
        let mut row = vec![0.0; n];
        for (j, value) in row.iter_mut().enumerate() {
            *value = inventory
                .intervention
                .column_entries(j)
                .into_iter()
                .map(|(k, b)| factors[k] * b)
                .sum();
        }
        Self::build(inventory, &row, solver, options)
    }

    /// Tree for a row of direct amounts per unit of provider activity.
    pub fn build(inventory: &Inventory, row: &[f64], solver: &LinearSolver, options: &TreeOptions) -> Result<Self> {
        let intensities = solver.solve(&inventory.technology.transpose(), row)?;
        let demand = inventory.tech_index.demand();
        let min_amount = options.cutoff * (demand * intensities[0]).abs();
        let mut builder = TreeBuilder {
            inventory,
            row,
            intensities,
            options,
            on_path: vec![false; inventory.tech_index.size()],
            min_amount,
        };
        let root = builder.node(0, demand, 0);
        debug!(amount = root.amount, "built contribution tree");
        Ok(Self { root })
    }
}

struct TreeBuilder<'a> {
    inventory: &'a Inventory,
    row: &'a [f64],
    intensities: Vec<f64>,
    options: &'a TreeOptions,
    on_path: Vec<bool>,
    min_amount: f64,
}

impl TreeBuilder<'_> {
    fn node(&mut self, pos: usize, requirement: f64, depth: usize) -> ContributionTreeNode {
        let inventory = self.inventory;
        let a = &inventory.technology;
        let diagonal = a.get(pos, pos);
        let activity = if diagonal == 0.0 { 0.0 } else { requirement / diagonal };

        let mut node = ContributionTreeNode {
            provider: inventory.tech_index.provider_at(pos),
            position: pos,
            requirement,
            amount: requirement * self.intensities[pos],
            direct: activity * self.row[pos],
            cycle: false,
            children: Vec::new(),
        };

        if self.on_path[pos] {
            node.cycle = true;
            return node;
        }
        if self.options.max_depth.is_some_and(|max| depth >= max) || activity == 0.0 {
            return node;
        }

        self.on_path[pos] = true;
        for supplier in self.suppliers(pos) {
            let input = a.get(supplier, pos);
            if input == 0.0 {
                continue;
            }
            let child_requirement = -input * activity;
            let amount = child_requirement * self.intensities[supplier];
            if self.min_amount > 0.0 && amount.abs() < self.min_amount {
                continue;
            }
            let child = self.node(supplier, child_requirement, depth + 1);
            node.children.push(child);
        }
        self.on_path[pos] = false;
        node
    }

    fn suppliers(&self, pos: usize) -> Vec<usize> {
        let index = &self.inventory.tech_index;
        if index.has_links() {
            return index.suppliers(pos).to_vec();
        }
        self.inventory
            .technology
            .column_entries(pos)
            .into_iter()
            .map(|(i, _)| i)
            .filter(|i| *i != pos)
            .collect()
    }
}

/// Format a contribution tree as a readable string
pub fn format_tree(
    node: &ContributionTreeNode,
    indent: usize,
    label: &dyn Fn(ProcessProduct) -> String,
) -> String {
    let mut output = String::new();
    let prefix = "  ".repeat(indent);
    let marker = if node.cycle { " (cycle)" } else { "" };
    output.push_str(&format!(
        "{}{} @ {:.4} -> {:.6e} (direct {:.6e}){}\n",
        prefix,
        label(node.provider),
        node.requirement,
        node.amount,
        node.direct,
        marker
    ));
    for child in &node.children {
        output.push_str(&format_tree(child, indent + 1, label));
    }
    output
}
