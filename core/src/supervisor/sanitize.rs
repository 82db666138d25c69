// Turns raw runtime initialization errors into short, user-presentable text.
// Raw messages can carry stack traces, file paths and interpreter noise.

const MAX_RAW_LEN: usize = 120;

const GENERIC: &str = "Initialization error";

/// Ordered: the first matching category wins
const CATEGORIES: &[(&[&str], &str)] = &[
    (
        &["modulenotfound", "no module named", "importerror", "missing dependency"],
        "Missing dependency",
    ),
    (&["attributeerror", "has no attribute"], "Incompatible runtime version"),
    (
        &["permission denied", "permissionerror", "not permitted", "eacces"],
        "Permission denied",
    ),
    (
        &["bluetooth", " ble ", "ble:", "bleak", "gatt"],
        "Bluetooth unavailable",
    ),
    (&["timed out", "timeout"], "Initialization timed out"),
    (
        &[
            "address already in use",
            "connection refused",
            "network is unreachable",
            "socket",
            "oserror",
            "network",
        ],
        "Network error",
    ),
];

/// Map a raw runtime error onto a short category
///
/// Unmatched messages are kept when short; long ones collapse to a generic text.
pub fn sanitize_init_error(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    for (needles, category) in CATEGORIES {
        if needles.iter().any(|n| lowered.contains(n)) {
            return (*category).to_string();
        }
    }

    let first_line = raw.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() || raw.chars().count() > MAX_RAW_LEN {
        GENERIC.to_string()
    } else {
        first_line.to_string()
    }
}
