use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parses a CPU quantity into millicores. Accepts plain core counts
/// ("2", "0.5") and the milli suffix ("250m").
pub fn cpu_millis(quantity: &Quantity) -> Option<i64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped.parse::<i64>().ok();
    }
    s.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as i64)
}

/// Parses a memory quantity into bytes. Accepts plain byte counts,
/// binary suffixes (Ki, Mi, Gi, Ti) and decimal suffixes (k, M, G, T).
pub fn memory_bytes(quantity: &Quantity) -> Option<i64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }
    const SUFFIXES: &[(&str, i64)] = &[
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];
    for (suffix, multiplier) in SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            return stripped
                .parse::<f64>()
                .ok()
                .map(|value| (value * *multiplier as f64).round() as i64);
        }
    }
    s.parse::<f64>().ok().map(|value| value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_owned())
    }

    #[test]
    fn cpu_parses_cores_and_millis() {
        assert_eq!(cpu_millis(&q("2")), Some(2000));
        assert_eq!(cpu_millis(&q("250m")), Some(250));
        assert_eq!(cpu_millis(&q("0.5")), Some(500));
        assert_eq!(cpu_millis(&q("")), None);
        assert_eq!(cpu_millis(&q("abc")), None);
    }

    #[test]
    fn memory_parses_binary_and_decimal_suffixes() {
        assert_eq!(memory_bytes(&q("128974848")), Some(128974848));
        assert_eq!(memory_bytes(&q("129Mi")), Some(129 * 1024 * 1024));
        assert_eq!(memory_bytes(&q("2Gi")), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(memory_bytes(&q("1500k")), Some(1_500_000));
        assert_eq!(memory_bytes(&q("1.5Gi")), Some(1_610_612_736));
        assert_eq!(memory_bytes(&q("oops")), None);
    }
}
