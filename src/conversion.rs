//! Unit and flow property conversion factors

use std::collections::HashMap;

use tracing::debug;

use crate::db::Store;
use crate::error::Result;

/// Scalars for unit and flow-property-factor ids, loaded once per store.
#[derive(Debug, Clone, Default)]
pub struct ConversionTable {
    property_factors: HashMap<i64, f64>,
    unit_factors: HashMap<i64, f64>,
}

impl ConversionTable {
    pub fn load(store: &dyn Store) -> Result<Self> {
        let property_factors: HashMap<i64, f64> = store.property_factors()?.into_iter().collect();
        let unit_factors: HashMap<i64, f64> = store.unit_factors()?.into_iter().collect();
        debug!(
            properties = property_factors.len(),
            units = unit_factors.len(),
            "loaded conversion table"
        );
        Ok(Self { property_factors, unit_factors })
    }

    pub fn from_factors(
        property_factors: impl IntoIterator<Item = (i64, f64)>,
        unit_factors: impl IntoIterator<Item = (i64, f64)>,
    ) -> Self {
        Self {
            property_factors: property_factors.into_iter().collect(),
            unit_factors: unit_factors.into_iter().collect(),
        }
    }

    /// Returns 1.0 for unknown ids: no conversion needed.
    pub fn property_factor(&self, id: i64) -> f64 {
        self.property_factors.get(&id).copied().unwrap_or(1.0)
    }

    /// Returns 1.0 for unknown ids: no conversion needed.
    pub fn unit_factor(&self, id: i64) -> f64 {
        self.unit_factors.get(&id).copied().unwrap_or(1.0)
    }

    /// Conversion of a characterization factor given per `unit` of the
    /// flow property to the reference unit of the flow.
    pub fn impact_conversion(&self, property_factor_id: i64, unit_id: i64) -> f64 {
        let unit_factor = self.unit_factor(unit_id);
        if unit_factor == 0.0 {
            return 0.0;
        }
        self.property_factor(property_factor_id) / unit_factor
    }

    /// Conversion of an exchange amount given in `unit` to the reference
    /// unit of the flow.
    pub fn exchange_conversion(&self, property_factor_id: i64, unit_id: i64) -> f64 {
        let property_factor = self.property_factor(property_factor_id);
        if property_factor == 0.0 {
            return 0.0;
        }
        self.unit_factor(unit_id) / property_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unknown_ids_are_neutral() {
        let table = ConversionTable::default();
        assert_eq!(table.property_factor(42), 1.0);
        assert_eq!(table.unit_factor(42), 1.0);
        assert_eq!(table.impact_conversion(1, 2), 1.0);
    }

    #[test]
    fn converts_grams_to_kilograms() {
        // 1 g = 0.001 kg; a factor of 5 per g is 5000 per kg
        let table = ConversionTable::from_factors([(1, 1.0)], [(2, 0.001)]);
        assert_eq!(table.impact_conversion(1, 2), 1000.0);
        assert_eq!(table.exchange_conversion(1, 2), 0.001);
    }

    proptest! {
        #[test]
        fn zero_unit_factor_gives_zero(property in -1e6f64..1e6) {
            let table = ConversionTable::from_factors([(1, property)], [(2, 0.0)]);
            let factor = table.impact_conversion(1, 2);
            prop_assert_eq!(factor, 0.0);
            prop_assert!(!factor.is_nan());
        }

        #[test]
        fn zero_property_factor_gives_zero(unit in -1e6f64..1e6) {
            let table = ConversionTable::from_factors([(1, 0.0)], [(2, unit)]);
            prop_assert_eq!(table.exchange_conversion(1, 2), 0.0);
        }
    }
}
