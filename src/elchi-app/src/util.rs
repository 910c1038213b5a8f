// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

/// Normalize a device model name to lowercase alphanumeric, so that
/// "Resistive Heater Tenma" and "resistive-heater-tenma" look up the same
/// backend.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Test Controller"), "testcontroller");
        assert_eq!(
            normalize_name("resistive-heater_tenma"),
            "resistiveheatertenma"
        );
        assert_eq!(normalize_name("Thermolino"), "thermolino");
    }
}
