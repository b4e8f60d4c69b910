//! A small sample database: steel from coal-fired electricity

use rusqlite::Connection;

use crate::allocation::AllocationMethod;
use crate::db;
use crate::error::Result;
use crate::models::{
    AllocationFactor, Descriptor, ExchangeRow, FlowType, ImpactFactorRow, ProcessLink, ProcessProduct,
    ProductSystem,
};

pub const STEEL_PRODUCTION: i64 = 1;
pub const ELECTRICITY_PRODUCTION: i64 = 2;
pub const COAL_MINING: i64 = 3;

pub const STEEL: i64 = 10;
pub const ELECTRICITY: i64 = 11;
pub const COAL: i64 = 12;
pub const SLAG: i64 = 13;

pub const CARBON_DIOXIDE: i64 = 100;
pub const HARD_COAL: i64 = 101;
pub const SULFUR_DIOXIDE: i64 = 102;

pub const SAMPLE_SYSTEM: i64 = 1;
pub const SAMPLE_METHOD: i64 = 1;
pub const CLIMATE_CHANGE: i64 = 1;
pub const ACIDIFICATION: i64 = 2;
pub const RESOURCE_DEPLETION: i64 = 3;

const KG: i64 = 1;
const G: i64 = 2;
const MJ: i64 = 3;
const KWH: i64 = 4;

fn descriptor(id: i64, ref_id: &str, name: &str) -> Descriptor {
    Descriptor { id, ref_id: ref_id.to_string(), name: name.to_string() }
}

fn exchange(id: i64, process_id: i64, flow_id: i64, amount: f64, is_input: bool, unit_id: i64) -> ExchangeRow {
    ExchangeRow {
        id,
        process_id,
        flow_id,
        amount,
        is_input,
        is_elementary: false,
        property_factor_id: flow_id,
        unit_id,
        location_id: None,
        default_provider_id: None,
    }
}

fn factor(impact_category_id: i64, flow_id: i64, amount: f64, unit_id: i64) -> ImpactFactorRow {
    ImpactFactorRow {
        impact_category_id,
        flow_id,
        amount,
        formula: None,
        property_factor_id: flow_id,
        unit_id,
        location_id: None,
        distribution_type: None,
        parameter1: None,
        parameter2: None,
        parameter3: None,
    }
}

/// Replaces the content of the database with the sample data.
///
/// Steel production needs 2 kWh of electricity per kg and emits 1.5 kg CO2;
/// slag is a co-product with a physical allocation share of 10%.
/// Electricity production burns 0.1 kg coal per MJ; coal mining extracts
/// 1.05 kg hard coal per kg. Product system 1 asks for 1000 kg steel.
pub fn load_sample_data(conn: &Connection) -> Result<()> {
    db::clear_data(conn)?;

    db::insert_location(conn, &descriptor(1, "loc-de", "Germany"))?;
    for (id, name, factor) in [(KG, "kg", 1.0), (G, "g", 0.001), (MJ, "MJ", 1.0), (KWH, "kWh", 3.6)] {
        db::insert_unit(conn, id, name, factor)?;
    }

    let flows = [
        (STEEL, "flow-steel", "steel", FlowType::Product),
        (ELECTRICITY, "flow-electricity", "electricity", FlowType::Product),
        (COAL, "flow-coal", "coal", FlowType::Product),
        (SLAG, "flow-slag", "slag", FlowType::Product),
        (CARBON_DIOXIDE, "flow-co2", "carbon dioxide", FlowType::Elementary),
        (HARD_COAL, "flow-hard-coal", "hard coal, in ground", FlowType::Elementary),
        (SULFUR_DIOXIDE, "flow-so2", "sulfur dioxide", FlowType::Elementary),
    ];
    for (id, ref_id, name, flow_type) in flows {
        db::insert_flow(conn, &descriptor(id, ref_id, name), flow_type)?;
        // one reference property per flow, keyed like the flow
        db::insert_property_factor(conn, id, id, 1.0)?;
    }

    db::insert_process(conn, &descriptor(STEEL_PRODUCTION, "proc-steel", "steel production"))?;
    db::insert_process(conn, &descriptor(ELECTRICITY_PRODUCTION, "proc-electricity", "electricity, hard coal"))?;
    db::insert_process(conn, &descriptor(COAL_MINING, "proc-coal", "hard coal mining"))?;

    let exchanges = [
        exchange(1, STEEL_PRODUCTION, STEEL, 1.0, false, KG),
        exchange(2, STEEL_PRODUCTION, SLAG, 0.2, false, KG),
        exchange(3, STEEL_PRODUCTION, ELECTRICITY, 2.0, true, KWH),
        exchange(4, STEEL_PRODUCTION, CARBON_DIOXIDE, 1.5, false, KG),
        exchange(5, ELECTRICITY_PRODUCTION, ELECTRICITY, 1.0, false, MJ),
        exchange(6, ELECTRICITY_PRODUCTION, COAL, 0.1, true, KG),
        exchange(7, ELECTRICITY_PRODUCTION, CARBON_DIOXIDE, 0.3, false, KG),
        exchange(8, ELECTRICITY_PRODUCTION, SULFUR_DIOXIDE, 2.0, false, G),
        exchange(9, COAL_MINING, COAL, 1.0, false, KG),
        exchange(10, COAL_MINING, HARD_COAL, 1.05, true, KG),
    ];
    for e in &exchanges {
        db::insert_exchange(conn, e)?;
    }
    for (product_id, value) in [(STEEL, 0.9), (SLAG, 0.1)] {
        db::insert_allocation_factor(
            conn,
            &AllocationFactor {
                process_id: STEEL_PRODUCTION,
                product_id,
                method: AllocationMethod::Physical,
                value,
                exchange_id: None,
            },
        )?;
    }

    db::insert_impact_method(conn, &descriptor(SAMPLE_METHOD, "method-sample", "Sample method"))?;
    let categories = [
        (CLIMATE_CHANGE, "cat-gwp", "Climate change"),
        (ACIDIFICATION, "cat-ap", "Acidification"),
        (RESOURCE_DEPLETION, "cat-adp", "Resource depletion"),
    ];
    for (id, ref_id, name) in categories {
        db::insert_impact_category(conn, &descriptor(id, ref_id, name), SAMPLE_METHOD)?;
    }
    db::insert_impact_factor(conn, &factor(CLIMATE_CHANGE, CARBON_DIOXIDE, 1.0, KG))?;
    db::insert_impact_factor(conn, &factor(ACIDIFICATION, SULFUR_DIOXIDE, 1.0, KG))?;
    db::insert_impact_factor(conn, &factor(RESOURCE_DEPLETION, HARD_COAL, 0.5, KG))?;

    let system = ProductSystem {
        id: SAMPLE_SYSTEM,
        name: "1000 kg steel".to_string(),
        reference: ProcessProduct::of(STEEL_PRODUCTION, STEEL),
        target_amount: 1000.0,
        links: vec![
            ProcessLink { provider_id: ELECTRICITY_PRODUCTION, flow_id: ELECTRICITY, process_id: STEEL_PRODUCTION },
            ProcessLink { provider_id: COAL_MINING, flow_id: COAL, process_id: ELECTRICITY_PRODUCTION },
        ],
    };
    db::insert_product_system(conn, &system, "ps-steel")?;
    Ok(())
}
