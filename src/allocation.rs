//! Allocation of multi-output processes

use serde::{Deserialize, Serialize};

use crate::models::{AllocationFactor, CalcExchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMethod {
    #[default]
    None,
    Physical,
    Economic,
    Causal,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::None => "NONE",
            AllocationMethod::Physical => "PHYSICAL",
            AllocationMethod::Economic => "ECONOMIC",
            AllocationMethod::Causal => "CAUSAL",
        }
    }

    pub fn parse(s: &str) -> Option<AllocationMethod> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Some(AllocationMethod::None),
            "PHYSICAL" => Some(AllocationMethod::Physical),
            "ECONOMIC" => Some(AllocationMethod::Economic),
            "CAUSAL" => Some(AllocationMethod::Causal),
            _ => None,
        }
    }

    /// The share of `exchange` that is attributed to `product_id`.
    ///
    /// Physical and economic factors apply to the whole process; causal
    /// factors may target single exchanges and fall back to a process-wide
    /// causal factor. A missing factor leaves the exchange unallocated.
    pub fn factor(&self, product_id: i64, exchange: &CalcExchange, factors: &[AllocationFactor]) -> f64 {
        let for_product = |f: &&AllocationFactor| f.product_id == product_id && f.method == *self;
        match self {
            AllocationMethod::None => 1.0,
            AllocationMethod::Physical | AllocationMethod::Economic => factors
                .iter()
                .filter(for_product)
                .find(|f| f.exchange_id.is_none())
                .map_or(1.0, |f| f.value),
            AllocationMethod::Causal => {
                let candidates: Vec<&AllocationFactor> = factors.iter().filter(for_product).collect();
                candidates
                    .iter()
                    .find(|f| f.exchange_id == Some(exchange.id))
                    .or_else(|| candidates.iter().find(|f| f.exchange_id.is_none()))
                    .map_or(1.0, |f| f.value)
            }
        }
    }

    /// Rewrites the exchanges of a process into the column of one of its
    /// products: the product output is kept as is, outputs of the other
    /// co-products are dropped (they have columns of their own) and every
    /// other exchange is scaled by its allocation factor.
    pub fn allocate(
        &self,
        product_id: i64,
        exchanges: &[CalcExchange],
        factors: &[AllocationFactor],
    ) -> Vec<(CalcExchange, f64)> {
        let mut allocated = Vec::with_capacity(exchanges.len());
        for e in exchanges {
            if e.is_product_output() {
                if e.flow_id == product_id {
                    allocated.push((e.clone(), 1.0));
                }
                continue;
            }
            let factor = self.factor(product_id, e, factors);
            if factor != 0.0 {
                allocated.push((e.clone(), factor));
            }
        }
        allocated
    }
}
