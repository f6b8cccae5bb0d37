// ── Vendor error-code translation ──
//
// Printers surface numeric HMS-style codes. This table maps the ones we
// recognize to a human message and severity. Unknown codes pass through
// with a generic warning entry -- dropping them would hide real faults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSeverity {
    Info,
    Warning,
    Critical,
}

/// Translated error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeInfo {
    pub code: String,
    pub message: String,
    pub severity: CodeSeverity,
}

// Known vendor codes. The left column is the normalized hex form the
// bambu adapter produces from the 4-part HMS attribute.
const KNOWN_CODES: &[(&str, &str, CodeSeverity)] = &[
    ("0300_0100", "Nozzle temperature abnormal", CodeSeverity::Critical),
    ("0300_0200", "Bed temperature abnormal", CodeSeverity::Critical),
    ("0300_0300", "Chamber temperature out of range", CodeSeverity::Warning),
    ("0300_1000", "Heatbed homing failed", CodeSeverity::Critical),
    ("0500_0100", "First layer inspection found defects", CodeSeverity::Warning),
    ("0500_0200", "Spaghetti failure suspected", CodeSeverity::Critical),
    ("0700_0100", "Feeder slot filament ran out", CodeSeverity::Warning),
    ("0700_0200", "Filament tangle detected in feeder", CodeSeverity::Critical),
    ("0700_0300", "Feeder failed to retract filament", CodeSeverity::Warning),
    ("0700_2000", "Feeder humidity high; filament may absorb moisture", CodeSeverity::Info),
    ("0C00_0100", "Door opened during print", CodeSeverity::Warning),
    ("1200_0100", "Motor driver overheated", CodeSeverity::Critical),
    ("1200_0200", "Resonance compensation data invalid", CodeSeverity::Warning),
];

/// Translate a vendor code. Unknown codes are passed through with a
/// generic message and warning severity.
pub fn translate(code: &str) -> CodeInfo {
    for (known, message, severity) in KNOWN_CODES {
        if code.eq_ignore_ascii_case(known) {
            return CodeInfo {
                code: (*known).to_string(),
                message: (*message).to_string(),
                severity: *severity,
            };
        }
    }
    CodeInfo {
        code: code.to_string(),
        message: format!("Printer reported code {code}"),
        severity: CodeSeverity::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_translates() {
        let info = translate("0700_0100");
        assert_eq!(info.severity, CodeSeverity::Warning);
        assert!(info.message.contains("ran out"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let info = translate("0c00_0100");
        assert_eq!(info.code, "0C00_0100");
    }

    #[test]
    fn unknown_code_passes_through_as_warning() {
        let info = translate("FFFF_0001");
        assert_eq!(info.severity, CodeSeverity::Warning);
        assert_eq!(info.code, "FFFF_0001");
        assert!(info.message.contains("FFFF_0001"));
    }
}
