//! Helpers shared by the unit tests: throwaway chains on in-memory stores
//! and easy difficulty so blocks mine instantly.

pub mod test_utils;
