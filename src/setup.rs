//! Calculation setup

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::allocation::AllocationMethod;
use crate::contribution::TreeOptions;
use crate::error::Result;
use crate::solver::SolverOptions;

/// What to calculate and how. Every field has a default so that a setup
/// file only needs to name what differs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationSetup {
    pub product_system_id: i64,
    pub impact_method_id: Option<i64>,
    pub allocation: AllocationMethod,
    /// Replaces the target amount of the product system.
    pub amount: Option<f64>,
    pub regionalized: bool,
    pub solver: SolverOptions,
    pub tree: TreeOptions,
}

impl CalculationSetup {
    pub fn new(product_system_id: i64) -> Self {
        Self { product_system_id, ..Default::default() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_setup_uses_defaults() {
        let setup: CalculationSetup =
            serde_json::from_str(r#"{"product_system_id": 3, "allocation": "PHYSICAL", "solver": {"tolerance": 1e-9}}"#)
                .unwrap();
        assert_eq!(setup.product_system_id, 3);
        assert_eq!(setup.allocation, AllocationMethod::Physical);
        assert_eq!(setup.solver.tolerance, 1e-9);
        assert_eq!(setup.solver.max_iterations, SolverOptions::default().max_iterations);
        assert_eq!(setup.tree, TreeOptions::default());
        assert!(setup.impact_method_id.is_none());
        assert!(!setup.regionalized);
    }

    #[test]
    fn reads_setup_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.json");
        let setup = CalculationSetup {
            impact_method_id: Some(5),
            amount: Some(2.0),
            ..CalculationSetup::new(1)
        };
        fs::write(&path, serde_json::to_string(&setup).unwrap()).unwrap();
        assert_eq!(CalculationSetup::from_file(&path).unwrap(), setup);
    }
}
