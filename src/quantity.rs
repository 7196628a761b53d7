use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/* ============================= PARSING ============================= */

// Binary and decimal suffix scales, in units (not millis).
const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1048576.0),
    ("Gi", 1073741824.0),
    ("Ti", 1099511627776.0),
    ("Pi", 1125899906842624.0),
    ("Ei", 1152921504606846976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 7] = [
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity string into milli-units (`"1"` → 1000, `"500m"` → 500).
///
/// Values beyond the i64 milli range saturate. Returns `None` for strings
/// that are not quantities.
pub fn parse_millis(q: &Quantity) -> Option<i64> {
    let s = q.0.trim();
    if s.is_empty() {
        return None;
    }

    let (mantissa, scale) = split_suffix(s)?;
    let value = mantissa * scale * 1000.0;
    if !value.is_finite() {
        return None;
    }
    if value >= i64::MAX as f64 {
        return Some(i64::MAX);
    }
    if value <= i64::MIN as f64 {
        return Some(i64::MIN);
    }
    Some(value.round() as i64)
}

fn split_suffix(s: &str) -> Option<(f64, f64)> {
    for (suffix, scale) in BINARY_SUFFIXES {
        if let Some(rest) = s.strip_suffix(suffix)
            && let Ok(n) = rest.parse::<f64>()
        {
            return Some((n, scale));
        }
    }
    for (suffix, scale) in DECIMAL_SUFFIXES {
        if let Some(rest) = s.strip_suffix(suffix)
            && let Ok(n) = rest.parse::<f64>()
        {
            return Some((n, scale));
        }
    }
    // Plain or scientific-notation number ("4", "0.5", "12e3").
    s.parse::<f64>().ok().map(|n| (n, 1.0))
}

/* ============================= FORMATTING ============================= */

/// Format milli-units back into a quantity: whole units when exact,
/// otherwise a milli-suffixed value.
pub fn format_millis(millis: i64) -> Quantity {
    if millis % 1000 == 0 {
        Quantity((millis / 1000).to_string())
    } else {
        Quantity(format!("{millis}m"))
    }
}

/* ============================= ARITHMETIC ============================= */

/// True when the quantity parses to a nonzero amount.
pub fn is_nonzero(q: &Quantity) -> bool {
    parse_millis(q).is_some_and(|m| m != 0)
}

/// `max(0, a − b)` in milli-units, for lending-limit arithmetic.
pub fn saturating_sub(a: &Quantity, b_millis: i64) -> i64 {
    parse_millis(a)
        .unwrap_or(0)
        .saturating_sub(b_millis)
        .max(0)
}

/// Sum a quantity into an accumulator of milli-units.
pub fn accumulate(total: &mut i64, q: &Quantity) {
    *total = total.saturating_add(parse_millis(q).unwrap_or(0));
}

/* ============================= TESTS ============================= */
