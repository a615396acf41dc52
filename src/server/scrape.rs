//! Prometheus text exposition.

use prometheus::{Encoder, Registry, TextEncoder};

/// Encode the registry into the text exposition format.
///
/// Returns the content type and the encoded body.
pub fn render(registry: &Registry) -> Result<(String, Vec<u8>), prometheus::Error> {
    let metric_families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Gauge;

    #[test]
    fn test_render_exposes_registered_gauge() {
        let registry = Registry::new();
        let gauge = Gauge::new("render_test_value", "A test value").unwrap();
        gauge.set(12.5);
        registry.register(Box::new(gauge)).unwrap();

        let (content_type, body) = render(&registry).unwrap();
        assert!(content_type.starts_with("text/plain"));

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("# HELP render_test_value A test value"));
        assert!(text.contains("render_test_value 12.5"));
    }

    #[test]
    fn test_render_empty_registry() {
        let registry = Registry::new();
        let (_, body) = render(&registry).unwrap();
        assert!(body.is_empty());
    }
}
