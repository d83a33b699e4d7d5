//! Instrument adapters built on the backend contract.

pub mod thorlabs;
