//! Endpoint management
use std::sync::Arc;

/// Immutable, ordered list of dialable addresses for one logical service
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EndpointSet {
    addresses: Arc<[String]>,
}

impl EndpointSet {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses: addresses.into(),
        }
    }

    /// Parse a comma separated list, trimming whitespace and skipping blanks
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn as_slice(&self) -> &[String] {
        &self.addresses
    }

    pub fn first(&self) -> Option<&String> {
        self.addresses.first()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_skips_blanks() {
        let set = EndpointSet::parse(" 10.0.0.1:9000,,10.0.0.2:9000 , ");
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().map(String::as_str), Some("10.0.0.1:9000"));
        assert_eq!(set.as_slice()[1], "10.0.0.2:9000");
    }

    #[test]
    fn test_parse_empty() {
        assert!(EndpointSet::parse("").is_empty());
    }
}
