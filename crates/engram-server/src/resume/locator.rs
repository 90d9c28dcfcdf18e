// crates/engram-server/src/resume/locator.rs
// Locator encoding: which node owns a conversation's live recording

use crate::error::{EngramError, Result};

/// `(host, port, fileName)` pointer, encoded `"<host>|<port>|<fileName>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub host: String,
    pub port: u16,
    pub file_name: String,
}

impl Locator {
    pub fn new(host: impl Into<String>, port: u16, file_name: impl Into<String>) -> Self {
        Self { host: host.into(), port, file_name: file_name.into() }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.host, self.port, self.file_name)
    }

    /// Parse by splitting on `|` into exactly three parts.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('|').collect();
        match parts.as_slice() {
            [host, port, file_name] => Ok(Self {
                host: host.to_string(),
                port: port
                    .parse()
                    .map_err(|_| EngramError::Other(format!("bad locator port in {s:?}")))?,
                file_name: file_name.to_string(),
            }),
            _ => Err(EngramError::Other(format!(
                "locator {s:?} must have exactly three |-separated parts"
            ))),
        }
    }

    /// The externally visible address of the owning node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let locator = Locator::new("node1", 8080, "engram-rec-c1.log");
        let encoded = locator.encode();
        assert_eq!(encoded, "node1|8080|engram-rec-c1.log");
        assert_eq!(Locator::parse(&encoded).unwrap(), locator);
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(Locator::parse("host|8080").is_err());
        assert!(Locator::parse("host|8080|file|extra").is_err());
        assert!(Locator::parse("host|notaport|file").is_err());
    }
}
