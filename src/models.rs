//! Data models for processes, flows and the values read from the store

use serde::{Deserialize, Serialize};

use crate::allocation::AllocationMethod;

/// The kinds of entities the store can list descriptors for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Process,
    Flow,
    Location,
    ImpactMethod,
    ImpactCategory,
    ProductSystem,
}

impl ModelType {
    pub fn table(&self) -> &'static str {
        match self {
            ModelType::Process => "processes",
            ModelType::Flow => "flows",
            ModelType::Location => "locations",
            ModelType::ImpactMethod => "impact_methods",
            ModelType::ImpactCategory => "impact_categories",
            ModelType::ProductSystem => "product_systems",
        }
    }
}

/// Lightweight view of a stored entity: the stable reference id is what
/// identifies it across stores, the numeric id only within one store.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub id: i64,
    pub ref_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    Elementary,
    Product,
    Waste,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Elementary => "ELEMENTARY",
            FlowType::Product => "PRODUCT",
            FlowType::Waste => "WASTE",
        }
    }

    pub fn parse(s: &str) -> Option<FlowType> {
        match s {
            "ELEMENTARY" => Some(FlowType::Elementary),
            "PRODUCT" => Some(FlowType::Product),
            "WASTE" => Some(FlowType::Waste),
            _ => None,
        }
    }
}

/// A raw exchange row of a process as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRow {
    pub id: i64,
    pub process_id: i64,
    pub flow_id: i64,
    pub amount: f64,
    pub is_input: bool,
    pub is_elementary: bool,
    pub property_factor_id: i64,
    pub unit_id: i64,
    pub location_id: Option<i64>,
    pub default_provider_id: Option<i64>,
}

/// An exchange with its amount converted to the reference unit of the flow.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcExchange {
    pub id: i64,
    pub process_id: i64,
    pub flow_id: i64,
    pub amount: f64,
    pub conversion_factor: f64,
    pub is_input: bool,
    pub is_elementary: bool,
    pub location_id: Option<i64>,
    pub default_provider_id: Option<i64>,
}

impl CalcExchange {
    /// Amount in the reference unit of the flow.
    pub fn converted_amount(&self) -> f64 {
        self.amount * self.conversion_factor
    }

    /// Products are outputs of non-elementary flows.
    pub fn is_product_output(&self) -> bool {
        !self.is_elementary && !self.is_input
    }

    pub fn is_product_input(&self) -> bool {
        !self.is_elementary && self.is_input
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UncertaintyType {
    None,
    LogNormal,
    Normal,
    Triangle,
    Uniform,
}

impl UncertaintyType {
    /// Maps the ordinal stored in the `distribution_type` column.
    pub fn from_ordinal(i: i64) -> Option<UncertaintyType> {
        match i {
            0 => Some(UncertaintyType::None),
            1 => Some(UncertaintyType::LogNormal),
            2 => Some(UncertaintyType::Normal),
            3 => Some(UncertaintyType::Triangle),
            4 => Some(UncertaintyType::Uniform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Uncertainty {
    pub kind: UncertaintyType,
    pub parameter1: f64,
    pub parameter2: f64,
    pub parameter3: f64,
}

/// Raw impact factor row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactFactorRow {
    pub impact_category_id: i64,
    pub flow_id: i64,
    pub amount: f64,
    pub formula: Option<String>,
    pub property_factor_id: i64,
    pub unit_id: i64,
    pub location_id: Option<i64>,
    pub distribution_type: Option<i64>,
    pub parameter1: Option<f64>,
    pub parameter2: Option<f64>,
    pub parameter3: Option<f64>,
}

/// Characterization factor ready for matrix insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactFactor {
    pub impact_category_id: i64,
    pub flow_id: i64,
    pub amount: f64,
    pub formula: Option<String>,
    pub conversion_factor: f64,
    pub location_id: Option<i64>,
    pub uncertainty: Option<Uncertainty>,
}

impl ImpactFactor {
    /// Factor per reference unit of the flow.
    pub fn value(&self) -> f64 {
        self.amount * self.conversion_factor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationFactor {
    pub process_id: i64,
    pub product_id: i64,
    pub method: AllocationMethod,
    pub value: f64,
    /// Causal factors may target a single exchange.
    pub exchange_id: Option<i64>,
}

/// A (process, product) pair: one provider column of the technology matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessProduct {
    pub process_id: i64,
    pub flow_id: i64,
}

impl ProcessProduct {
    pub fn of(process_id: i64, flow_id: i64) -> Self {
        Self { process_id, flow_id }
    }
}

/// An elementary flow entry of the intervention matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexFlow {
    pub flow_id: i64,
    pub is_input: bool,
    pub location_id: Option<i64>,
}

impl IndexFlow {
    pub fn input(flow_id: i64) -> Self {
        Self { flow_id, is_input: true, location_id: None }
    }

    pub fn output(flow_id: i64) -> Self {
        Self { flow_id, is_input: false, location_id: None }
    }

    pub fn at(self, location_id: Option<i64>) -> Self {
        Self { location_id, ..self }
    }
}

/// A link in a product system: `provider` delivers `flow_id` to `process_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessLink {
    pub provider_id: i64,
    pub flow_id: i64,
    pub process_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductSystem {
    pub id: i64,
    pub name: String,
    pub reference: ProcessProduct,
    pub target_amount: f64,
    pub links: Vec<ProcessLink>,
}
