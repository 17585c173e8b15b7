//! Topic name parsing: `persistent|non-persistent://tenant/namespace/topic`.

use crate::error::{Error, Result};

/// A fully-qualified topic name. Short names (`my-topic`) expand to
/// `persistent://public/default/my-topic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    pub persistent: bool,
    pub tenant: String,
    pub namespace: String,
    pub topic: String,
}

impl TopicName {
    pub fn parse(raw: &str) -> Result<Self> {
        let (persistent, rest) = if let Some(rest) = raw.strip_prefix("persistent://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("non-persistent://") {
            (false, rest)
        } else if raw.contains("://") {
            return Err(Error::InvalidConfiguration(format!(
                "topic '{}' has an unknown domain",
                raw
            )));
        } else {
            // Shorthand: bare topic in the default namespace.
            return Ok(Self {
                persistent: true,
                tenant: "public".into(),
                namespace: "default".into(),
                topic: validate_segment(raw, raw)?.to_string(),
            });
        };

        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(namespace), Some(topic))
                if !tenant.is_empty() && !namespace.is_empty() && !topic.is_empty() =>
            {
                Ok(Self {
                    persistent,
                    tenant: tenant.to_string(),
                    namespace: namespace.to_string(),
                    topic: validate_segment(topic, raw)?.to_string(),
                })
            }
            _ => Err(Error::InvalidConfiguration(format!(
                "topic '{}' must be domain://tenant/namespace/topic",
                raw
            ))),
        }
    }

    /// `tenant/namespace`, the unit namespace-level operations address.
    pub fn namespace_name(&self) -> String {
        format!("{}/{}", self.tenant, self.namespace)
    }

    /// Partition index when this is one shard of a partitioned topic.
    pub fn partition_index(&self) -> Option<i32> {
        let (_, idx) = self.topic.rsplit_once("-partition-")?;
        idx.parse().ok()
    }
}

fn validate_segment<'a>(segment: &'a str, raw: &str) -> Result<&'a str> {
    if !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=' | ':' | '%'))
    {
        Ok(segment)
    } else {
        Err(Error::InvalidConfiguration(format!(
            "topic '{}' is not a valid topic name",
            raw
        )))
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            if self.persistent {
                "persistent"
            } else {
                "non-persistent"
            },
            self.tenant,
            self.namespace,
            self.topic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_qualified() {
        let t = TopicName::parse("persistent://acme/prod/orders").unwrap();
        assert!(t.persistent);
        assert_eq!(t.tenant, "acme");
        assert_eq!(t.namespace_name(), "acme/prod");
        assert_eq!(t.to_string(), "persistent://acme/prod/orders");
    }

    #[test]
    fn test_non_persistent() {
        let t = TopicName::parse("non-persistent://acme/prod/ticker").unwrap();
        assert!(!t.persistent);
    }

    #[test]
    fn test_shorthand_expands() {
        let t = TopicName::parse("orders").unwrap();
        assert_eq!(t.to_string(), "persistent://public/default/orders");
    }

    #[test]
    fn test_partition_suffix() {
        let t = TopicName::parse("persistent://acme/prod/orders-partition-3").unwrap();
        assert_eq!(t.partition_index(), Some(3));
        let plain = TopicName::parse("persistent://acme/prod/orders").unwrap();
        assert_eq!(plain.partition_index(), None);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(TopicName::parse("http://acme/prod/orders").is_err());
        assert!(TopicName::parse("persistent://acme/orders").is_err());
        assert!(TopicName::parse("persistent://acme/prod/bad topic").is_err());
    }
}
