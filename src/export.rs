//! CSV export of the matrix indices

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::db::Store;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::models::{Descriptor, ModelType};

/// Writes `index_A.csv` (providers) and `index_B.csv` (elementary flows)
/// for the matrices of `inventory`. Entities missing from the store are
/// written with empty reference ids and names.
pub fn write_csv_indices(folder: &Path, inventory: &Inventory, store: &dyn Store) -> Result<()> {
    let processes = by_id(store.descriptors(ModelType::Process)?);
    let flows = by_id(store.descriptors(ModelType::Flow)?);
    let locations = by_id(store.descriptors(ModelType::Location)?);

    let mut tech = String::from("index,process_id,process_name,flow_id,flow_name\n");
    for (i, p) in inventory.tech_index.providers().iter().enumerate() {
        let process = processes.get(&p.process_id);
        let flow = flows.get(&p.flow_id);
        push_row(
            &mut tech,
            &[
                &i.to_string(),
                ref_id(process),
                name(process),
                ref_id(flow),
                name(flow),
            ],
        );
    }

    let mut elementary = String::from("index,flow_id,flow_name,direction,location_id\n");
    for (i, f) in inventory.flow_index.flows().iter().enumerate() {
        let flow = flows.get(&f.flow_id);
        let location = f.location_id.and_then(|id| locations.get(&id));
        push_row(
            &mut elementary,
            &[
                &i.to_string(),
                ref_id(flow),
                name(flow),
                if f.is_input { "input" } else { "output" },
                ref_id(location),
            ],
        );
    }

    fs::create_dir_all(folder)?;
    fs::write(folder.join("index_A.csv"), tech)?;
    fs::write(folder.join("index_B.csv"), elementary)?;
    info!(
        folder = %folder.display(),
        providers = inventory.tech_index.size(),
        flows = inventory.flow_index.size(),
        "exported matrix indices"
    );
    Ok(())
}

fn by_id(descriptors: Vec<Descriptor>) -> HashMap<i64, Descriptor> {
    descriptors.into_iter().map(|d| (d.id, d)).collect()
}

fn ref_id(d: Option<&Descriptor>) -> &str {
    d.map_or("", |d| d.ref_id.as_str())
}

fn name(d: Option<&Descriptor>) -> &str {
    d.map_or("", |d| d.name.as_str())
}

fn push_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&quote(field));
    }
    out.push('\n');
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
