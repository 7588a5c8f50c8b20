//! The dialable upstream target type

use std::fmt;

/// A dialable backend target: a discovered internal address joined with the
/// fixed service port. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    dial: String,
}

impl Upstream {
    /// Join an address and port into a dial target. IPv6 addresses are
    /// bracketed so the result parses as `host:port`.
    pub fn new(address: &str, port: u16) -> Self {
        let dial = if address.contains(':') {
            format!("[{}]:{}", address, port)
        } else {
            format!("{}:{}", address, port)
        };
        Self { dial }
    }

    /// The `address:port` string the proxy should dial.
    pub fn dial(&self) -> &str {
        &self.dial
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_dial() {
        let up = Upstream::new("10.128.0.3", 30080);
        assert_eq!(up.dial(), "10.128.0.3:30080");
    }

    #[test]
    fn test_ipv6_dial_is_bracketed() {
        let up = Upstream::new("fd00::3", 30080);
        assert_eq!(up.dial(), "[fd00::3]:30080");
    }

    #[test]
    fn test_equality_by_dial_string() {
        assert_eq!(Upstream::new("10.0.0.1", 32080), Upstream::new("10.0.0.1", 32080));
        assert_ne!(Upstream::new("10.0.0.1", 32080), Upstream::new("10.0.0.1", 30080));
    }

    #[test]
    fn test_display() {
        assert_eq!(Upstream::new("10.0.0.1", 32080).to_string(), "10.0.0.1:32080");
    }
}
