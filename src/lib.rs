//! Life-cycle inventory engine
//!
//! Builds technology and intervention matrices for linked process networks,
//! solves them for scaling factors, derives elementary flow and impact
//! results and decomposes totals into contribution trees. Matrices can also
//! come from precomputed libraries on disk.

pub mod allocation;
pub mod cache;
pub mod calculator;
pub mod contribution;
pub mod conversion;
pub mod db;
pub mod error;
pub mod export;
pub mod impact;
pub mod index;
pub mod inventory;
pub mod library;
pub mod matrix;
pub mod models;
pub mod npy;
pub mod npz;
pub mod sample;
pub mod setup;
pub mod solver;

pub use calculator::{SimpleResult, calculate};
pub use error::{CalcError, DataWarning, Result};
pub use setup::CalculationSetup;
