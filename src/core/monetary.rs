/// Ledger monetary constants
///
/// Amounts are whole numbers of the smallest unit. One coin is a million
/// units, and each block mints 500 coins plus the fees it collects.
///
/// Number of units in one coin
pub const UNITS_PER_COIN: u64 = 1_000_000;

/// Block reward in units (500 coins)
pub const INITIAL_BLOCK_REWARD: u64 = 500 * UNITS_PER_COIN;

/// Default fee in units attached by `transfer` when none is given
pub const DEFAULT_TRANSACTION_FEE: u64 = 1_000;

/// Utility functions for monetary conversions
pub mod conversions {
    use super::*;

    /// Convert units to coins
    pub fn units_to_coins(units: u64) -> f64 {
        units as f64 / UNITS_PER_COIN as f64
    }

    /// Format units as a human-readable string
    ///
    /// # Examples
    /// ```
    /// use utxo_ledger::core::monetary::conversions::format_units;
    /// assert_eq!(format_units(1_500_000), "1.500000 coins");
    /// ```
    pub fn format_units(units: u64) -> String {
        format!("{:.6} coins", units_to_coins(units))
    }
}
