//! PromQL-safe `__name__` derivation from a dotted sample name (spec.md
//! §4.3.1).

const COUNTER_HINTS: &[&str] = &[
    "total", "count", "sent", "received", "tx", "rx", "read", "write", "uploaded", "downloaded", "failed", "success",
    "error", "request", "response",
];

/// Sanitizes a dotted metric name into a PromQL-safe `__name__`. Idempotent:
/// `sanitize(sanitize(n)) == sanitize(n)` (spec.md §8, property 7).
pub fn sanitize_name(name: &str) -> String {
    let mut out = name.replace('.', "_");
    let lower = out.to_lowercase();

    if COUNTER_HINTS.iter().any(|hint| lower.contains(hint)) {
        if !out.ends_with("_total") {
            out.push_str("_total");
        }
        return out;
    }

    if contains_temperature_hint(&lower) {
        if !out.ends_with("_celsius") {
            out.push_str("_celsius");
        }
        return out;
    }

    if lower.contains("bytes") || lower.contains("byte") {
        if !out.ends_with("_bytes") {
            out.push_str("_bytes");
        }
        return out;
    }

    out
}

/// True if `lower` contains `temperature`, or contains `temp` as a whole
/// word (flanked by `_`/start/end), excluding words like `attempts` or
/// `template` that merely contain the substring `temp`.
fn contains_temperature_hint(lower: &str) -> bool {
    if lower.contains("temperature") {
        return true;
    }

    let bytes = lower.as_bytes();
    let needle = b"temp";
    let mut start = 0;
    while let Some(pos) = find(&bytes[start..], needle) {
        let idx = start + pos;
        let before_ok = idx == 0 || bytes[idx - 1] == b'_';
        let after_idx = idx + needle.len();
        let after_ok = after_idx == bytes.len() || bytes[after_idx] == b'_';
        if before_ok && after_ok {
            return true;
        }
        start = idx + 1;
    }
    false
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dots_become_underscores() {
        assert_eq!(sanitize_name("cpu.load"), "cpu_load");
    }

    #[test]
    fn counter_heuristic_wins_and_appends_total_once() {
        assert_eq!(sanitize_name("bytes.sent"), "bytes_sent_total");
        assert_eq!(sanitize_name("requests.sent_total"), "requests_sent_total");
    }

    #[test]
    fn temperature_whole_word_only() {
        assert_eq!(sanitize_name("cpu.temperature"), "cpu_temperature_celsius");
        assert_eq!(sanitize_name("sensor.temp"), "sensor_temp_celsius");
        assert_eq!(sanitize_name("retry.attempts"), "retry_attempts");
        assert_eq!(sanitize_name("config.template"), "config_template");
    }

    #[test]
    fn bytes_suffix_applied_when_no_other_hint_matches() {
        assert_eq!(sanitize_name("memory.used_bytes"), "memory_used_bytes");
        assert_eq!(sanitize_name("memory.byte_pool"), "memory_byte_pool_bytes");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for name in ["cpu.temperature", "network.tx", "memory.used", "disk.free_bytes", "stream.loss_ratio"] {
            let once = sanitize_name(name);
            let twice = sanitize_name(&once);
            assert_eq!(once, twice);
        }
    }
}
