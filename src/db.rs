//! Backing store: schema, the read contract used by the engine and its
//! SQLite implementation

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};

use crate::allocation::AllocationMethod;
use crate::error::Result;
use crate::models::{
    AllocationFactor, Descriptor, ExchangeRow, FlowType, ImpactFactorRow, ModelType, ProcessLink,
    ProcessProduct, ProductSystem,
};

/// Read-only access to the data a calculation needs. The engine never
/// writes through this trait.
pub trait Store: Send + Sync {
    fn descriptors(&self, kind: ModelType) -> Result<Vec<Descriptor>>;

    fn exchanges(&self, process_id: i64) -> Result<Vec<ExchangeRow>>;

    fn allocation_factors(&self, process_id: i64) -> Result<Vec<AllocationFactor>>;

    fn impact_factors(&self, impact_category_id: i64) -> Result<Vec<ImpactFactorRow>>;

    /// `(unit id, conversion factor to the reference unit of its group)`
    fn unit_factors(&self) -> Result<Vec<(i64, f64)>>;

    /// `(flow property factor id, conversion factor)`
    fn property_factors(&self) -> Result<Vec<(i64, f64)>>;

    fn impact_categories(&self, method_id: i64) -> Result<Vec<Descriptor>>;

    fn product_system(&self, id: i64) -> Result<Option<ProductSystem>>;

    /// Ids of processes with a product output of the given flow, ascending.
    fn providers_of(&self, flow_id: i64) -> Result<Vec<i64>>;

    fn exchanges_of(&self, process_ids: &[i64]) -> Result<Vec<ExchangeRow>> {
        let mut rows = Vec::new();
        for id in process_ids {
            rows.extend(self.exchanges(*id)?);
        }
        Ok(rows)
    }

    fn allocation_factors_of(&self, process_ids: &[i64]) -> Result<Vec<AllocationFactor>> {
        let mut rows = Vec::new();
        for id in process_ids {
            rows.extend(self.allocation_factors(*id)?);
        }
        Ok(rows)
    }

    fn impact_factors_of(&self, impact_category_ids: &[i64]) -> Result<Vec<ImpactFactorRow>> {
        let mut rows = Vec::new();
        for id in impact_category_ids {
            rows.extend(self.impact_factors(*id)?);
        }
        Ok(rows)
    }
}

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flows (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            flow_type TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processes (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );

        -- Units with their factor to the reference unit of the unit group
        CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            conversion_factor REAL NOT NULL
        );

        -- Factor of a flow property relative to the reference property of a flow
        CREATE TABLE IF NOT EXISTS flow_property_factors (
            id INTEGER PRIMARY KEY,
            flow_id INTEGER,
            conversion_factor REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS exchanges (
            id INTEGER PRIMARY KEY,
            process_id INTEGER NOT NULL,
            flow_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            is_input INTEGER NOT NULL,
            property_factor_id INTEGER,
            unit_id INTEGER,
            location_id INTEGER,
            default_provider_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS allocation_factors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_id INTEGER NOT NULL,
            product_id INTEGER NOT NULL,
            method TEXT NOT NULL,
            value REAL NOT NULL,
            exchange_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS impact_methods (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS impact_categories (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            method_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS impact_factors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            impact_category_id INTEGER NOT NULL,
            flow_id INTEGER NOT NULL,
            value REAL NOT NULL,
            formula TEXT,
            property_factor_id INTEGER,
            unit_id INTEGER,
            location_id INTEGER,
            distribution_type INTEGER,
            parameter1_value REAL,
            parameter2_value REAL,
            parameter3_value REAL
        );

        CREATE TABLE IF NOT EXISTS product_systems (
            id INTEGER PRIMARY KEY,
            ref_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            reference_process_id INTEGER NOT NULL,
            reference_flow_id INTEGER NOT NULL,
            target_amount REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS process_links (
            product_system_id INTEGER NOT NULL,
            provider_id INTEGER NOT NULL,
            flow_id INTEGER NOT NULL,
            process_id INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_exchanges_process ON exchanges(process_id);
        CREATE INDEX IF NOT EXISTS idx_exchanges_flow ON exchanges(flow_id);
        CREATE INDEX IF NOT EXISTS idx_allocation_process ON allocation_factors(process_id);
        CREATE INDEX IF NOT EXISTS idx_impact_factors_category ON impact_factors(impact_category_id);
        CREATE INDEX IF NOT EXISTS idx_links_system ON process_links(product_system_id);
        "#,
    )?;
    Ok(())
}

pub fn insert_location(conn: &Connection, location: &Descriptor) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO locations (id, ref_id, name) VALUES (?1, ?2, ?3)",
        (location.id, &location.ref_id, &location.name),
    )?;
    Ok(())
}

pub fn insert_flow(conn: &Connection, flow: &Descriptor, flow_type: FlowType) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO flows (id, ref_id, name, flow_type) VALUES (?1, ?2, ?3, ?4)",
        (flow.id, &flow.ref_id, &flow.name, flow_type.as_str()),
    )?;
    Ok(())
}

pub fn insert_process(conn: &Connection, process: &Descriptor) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO processes (id, ref_id, name) VALUES (?1, ?2, ?3)",
        (process.id, &process.ref_id, &process.name),
    )?;
    Ok(())
}

pub fn insert_unit(conn: &Connection, id: i64, name: &str, conversion_factor: f64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO units (id, name, conversion_factor) VALUES (?1, ?2, ?3)",
        (id, name, conversion_factor),
    )?;
    Ok(())
}

pub fn insert_property_factor(
    conn: &Connection,
    id: i64,
    flow_id: i64,
    conversion_factor: f64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO flow_property_factors (id, flow_id, conversion_factor)
         VALUES (?1, ?2, ?3)",
        (id, flow_id, conversion_factor),
    )?;
    Ok(())
}

/// Insert an exchange; `is_elementary` is derived from the flow type on read.
pub fn insert_exchange(conn: &Connection, e: &ExchangeRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO exchanges (id, process_id, flow_id, amount, is_input,
            property_factor_id, unit_id, location_id, default_provider_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        (
            e.id,
            e.process_id,
            e.flow_id,
            e.amount,
            e.is_input,
            e.property_factor_id,
            e.unit_id,
            e.location_id,
            e.default_provider_id,
        ),
    )?;
    Ok(())
}

pub fn insert_allocation_factor(conn: &Connection, f: &AllocationFactor) -> Result<()> {
    conn.execute(
        "INSERT INTO allocation_factors (process_id, product_id, method, value, exchange_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (f.process_id, f.product_id, f.method.as_str(), f.value, f.exchange_id),
    )?;
    Ok(())
}

pub fn insert_impact_method(conn: &Connection, method: &Descriptor) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO impact_methods (id, ref_id, name) VALUES (?1, ?2, ?3)",
        (method.id, &method.ref_id, &method.name),
    )?;
    Ok(())
}

pub fn insert_impact_category(conn: &Connection, category: &Descriptor, method_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO impact_categories (id, ref_id, name, method_id)
         VALUES (?1, ?2, ?3, ?4)",
        (category.id, &category.ref_id, &category.name, method_id),
    )?;
    Ok(())
}

pub fn insert_impact_factor(conn: &Connection, f: &ImpactFactorRow) -> Result<()> {
    conn.execute(
        "INSERT INTO impact_factors (impact_category_id, flow_id, value, formula,
            property_factor_id, unit_id, location_id, distribution_type,
            parameter1_value, parameter2_value, parameter3_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            f.impact_category_id,
            f.flow_id,
            f.amount,
            f.formula,
            f.property_factor_id,
            f.unit_id,
            f.location_id,
            f.distribution_type,
            f.parameter1,
            f.parameter2,
            f.parameter3,
        ],
    )?;
    Ok(())
}

pub fn insert_product_system(conn: &Connection, system: &ProductSystem, ref_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO product_systems (id, ref_id, name, reference_process_id,
            reference_flow_id, target_amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            system.id,
            ref_id,
            &system.name,
            system.reference.process_id,
            system.reference.flow_id,
            system.target_amount,
        ),
    )?;
    conn.execute(
        "DELETE FROM process_links WHERE product_system_id = ?1",
        [system.id],
    )?;
    for link in &system.links {
        conn.execute(
            "INSERT INTO process_links (product_system_id, provider_id, flow_id, process_id)
             VALUES (?1, ?2, ?3, ?4)",
            (system.id, link.provider_id, link.flow_id, link.process_id),
        )?;
    }
    Ok(())
}

/// Clear all model data
pub fn clear_data(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DELETE FROM process_links;
        DELETE FROM product_systems;
        DELETE FROM impact_factors;
        DELETE FROM impact_categories;
        DELETE FROM impact_methods;
        DELETE FROM allocation_factors;
        DELETE FROM exchanges;
        DELETE FROM flow_property_factors;
        DELETE FROM units;
        DELETE FROM processes;
        DELETE FROM flows;
        DELETE FROM locations;
        "#,
    )?;
    Ok(())
}

const EXCHANGE_COLUMNS: &str = "SELECT e.id, e.process_id, e.flow_id, e.amount, e.is_input,
        f.flow_type, e.property_factor_id, e.unit_id, e.location_id, e.default_provider_id
     FROM exchanges e LEFT JOIN flows f ON f.id = e.flow_id";

fn exchange_row(row: &Row) -> rusqlite::Result<ExchangeRow> {
    let flow_type: Option<String> = row.get(5)?;
    Ok(ExchangeRow {
        id: row.get(0)?,
        process_id: row.get(1)?,
        flow_id: row.get(2)?,
        amount: row.get(3)?,
        is_input: row.get(4)?,
        is_elementary: flow_type.as_deref().and_then(FlowType::parse) == Some(FlowType::Elementary),
        property_factor_id: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        unit_id: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        location_id: row.get(8)?,
        default_provider_id: row.get(9)?,
    })
}

const ALLOCATION_COLUMNS: &str =
    "SELECT process_id, product_id, method, value, exchange_id FROM allocation_factors";

fn allocation_row(row: &Row) -> rusqlite::Result<Option<AllocationFactor>> {
    let method: String = row.get(2)?;
    let Some(method) = AllocationMethod::parse(&method) else {
        return Ok(None);
    };
    Ok(Some(AllocationFactor {
        process_id: row.get(0)?,
        product_id: row.get(1)?,
        method,
        value: row.get(3)?,
        exchange_id: row.get(4)?,
    }))
}

const IMPACT_FACTOR_COLUMNS: &str = "SELECT impact_category_id, flow_id, value, formula,
        property_factor_id, unit_id, location_id, distribution_type,
        parameter1_value, parameter2_value, parameter3_value
     FROM impact_factors";

fn impact_factor_row(row: &Row) -> rusqlite::Result<ImpactFactorRow> {
    Ok(ImpactFactorRow {
        impact_category_id: row.get(0)?,
        flow_id: row.get(1)?,
        amount: row.get(2)?,
        formula: row.get(3)?,
        property_factor_id: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        unit_id: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        location_id: row.get(6)?,
        distribution_type: row.get(7)?,
        parameter1: row.get(8)?,
        parameter2: row.get(9)?,
        parameter3: row.get(10)?,
    })
}

/// `?1, ?2, ...` for an `IN (...)` clause
fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// A store backed by one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self::new(conn))
    }

    /// An empty in-memory store with the schema created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::new(conn))
    }

    /// Runs `f` with exclusive access to the connection, e.g. for inserts.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn query_by_ids<T>(
        &self,
        sql: &str,
        column: &str,
        ids: &[i64],
        map: impl Fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let query = format!("{} WHERE {} IN ({})", sql, column, placeholders(ids.len()));
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| map(row))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

impl Store for SqliteStore {
    fn descriptors(&self, kind: ModelType) -> Result<Vec<Descriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, ref_id, name FROM {} ORDER BY id",
            kind.table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(Descriptor {
                id: row.get(0)?,
                ref_id: row.get(1)?,
                name: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn exchanges(&self, process_id: i64) -> Result<Vec<ExchangeRow>> {
        self.exchanges_of(&[process_id])
    }

    fn exchanges_of(&self, process_ids: &[i64]) -> Result<Vec<ExchangeRow>> {
        self.query_by_ids(EXCHANGE_COLUMNS, "e.process_id", process_ids, exchange_row)
    }

    fn allocation_factors(&self, process_id: i64) -> Result<Vec<AllocationFactor>> {
        self.allocation_factors_of(&[process_id])
    }

    fn allocation_factors_of(&self, process_ids: &[i64]) -> Result<Vec<AllocationFactor>> {
        let rows = self.query_by_ids(ALLOCATION_COLUMNS, "process_id", process_ids, allocation_row)?;
        Ok(rows.into_iter().flatten().collect())
    }

    fn impact_factors(&self, impact_category_id: i64) -> Result<Vec<ImpactFactorRow>> {
        self.impact_factors_of(&[impact_category_id])
    }

    fn impact_factors_of(&self, impact_category_ids: &[i64]) -> Result<Vec<ImpactFactorRow>> {
        self.query_by_ids(
            IMPACT_FACTOR_COLUMNS,
            "impact_category_id",
            impact_category_ids,
            impact_factor_row,
        )
    }

    fn unit_factors(&self) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, conversion_factor FROM units")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn property_factors(&self) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, conversion_factor FROM flow_property_factors")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn impact_categories(&self, method_id: i64) -> Result<Vec<Descriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ref_id, name FROM impact_categories WHERE method_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([method_id], |row| {
            Ok(Descriptor {
                id: row.get(0)?,
                ref_id: row.get(1)?,
                name: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn product_system(&self, id: i64) -> Result<Option<ProductSystem>> {
        let conn = self.conn.lock();
        let system = conn
            .query_row(
                "SELECT id, name, reference_process_id, reference_flow_id, target_amount
                 FROM product_systems WHERE id = ?1",
                [id],
                |row| {
                    Ok(ProductSystem {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        reference: ProcessProduct::of(row.get(2)?, row.get(3)?),
                        target_amount: row.get(4)?,
                        links: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut system) = system else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT provider_id, flow_id, process_id FROM process_links
             WHERE product_system_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(ProcessLink {
                provider_id: row.get(0)?,
                flow_id: row.get(1)?,
                process_id: row.get(2)?,
            })
        })?;
        for row in rows {
            system.links.push(row?);
        }
        Ok(Some(system))
    }

    fn providers_of(&self, flow_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.process_id FROM exchanges e
             JOIN flows f ON f.id = e.flow_id
             WHERE e.flow_id = ?1 AND e.is_input = 0 AND f.flow_type != 'ELEMENTARY'
             ORDER BY e.process_id",
        )?;
        let rows = stmt.query_map([flow_id], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
