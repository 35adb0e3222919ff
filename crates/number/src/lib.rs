//! Conversions between on-chain integers and the arbitrary precision types
//! used for database columns and ratios.

pub mod conversions;
