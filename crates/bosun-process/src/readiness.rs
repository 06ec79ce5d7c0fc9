//! Readiness detection for dev-server processes.
//!
//! Discovering the port a dev server bound to is inherently fragile
//! pattern-matching on its log output, so the strategy is pluggable:
//! the dev-server manager feeds every output chunk through a
//! [`ReadinessDetector`] and transitions to `running` on the first hit.

use regex::Regex;

/// Strategy for spotting a bound network port in process output.
pub trait ReadinessDetector: Send + Sync {
    /// Inspect one output chunk; return the bound port if this chunk
    /// proves the server is up.
    fn detect(&self, chunk: &str) -> Option<u16>;
}

/// Default detector: matches the startup lines printed by the common
/// dev-server toolchains (vite, next, webpack-dev-server, rails, etc).
pub struct PortLineDetector {
    patterns: Vec<Regex>,
}

impl PortLineDetector {
    pub fn new() -> Self {
        let patterns = [
            // "Local:   http://localhost:4000/" (vite, next)
            r"(?i)local:?\s+https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{2,5})",
            // any bare localhost URL
            r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{2,5})",
            // "Listening on port 8080", "server started on port 3000"
            r"(?i)(?:listening|running|started|ready)[^\n]*?port\s+(\d{2,5})",
            // "port: 5173"
            r"(?i)port\s*[:=]\s*(\d{2,5})",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();
        Self { patterns }
    }
}

impl Default for PortLineDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessDetector for PortLineDetector {
    fn detect(&self, chunk: &str) -> Option<u16> {
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(chunk) {
                if let Some(port) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) {
                    return Some(port);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_vite_local_line() {
        let det = PortLineDetector::new();
        assert_eq!(det.detect("  ➜  Local:   http://localhost:5173/"), Some(5173));
    }

    #[test]
    fn detects_plain_localhost_url() {
        let det = PortLineDetector::new();
        assert_eq!(
            det.detect("Local: http://localhost:4000"),
            Some(4000)
        );
        assert_eq!(det.detect("App running at http://127.0.0.1:8080/"), Some(8080));
    }

    #[test]
    fn detects_listening_on_port() {
        let det = PortLineDetector::new();
        assert_eq!(det.detect("Server listening on port 3000"), Some(3000));
        assert_eq!(det.detect("ready - started server on port 3001"), Some(3001));
    }

    #[test]
    fn detects_port_assignment() {
        let det = PortLineDetector::new();
        assert_eq!(det.detect("port: 5173"), Some(5173));
    }

    #[test]
    fn ignores_unrelated_output() {
        let det = PortLineDetector::new();
        assert_eq!(det.detect("compiling 42 modules..."), None);
        assert_eq!(det.detect("warning: large bundle"), None);
        assert_eq!(det.detect(""), None);
    }

    #[test]
    fn ignores_out_of_range_ports() {
        let det = PortLineDetector::new();
        assert_eq!(det.detect("http://localhost:99999"), None);
    }
}
