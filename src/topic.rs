//! Hierarchical addresses of the form
//! `namespace/asset/submodel/element[/REQ|/RESP]`.

use crate::Error;
use std::fmt;
use std::str::FromStr;

pub const SEPARATOR: char = '/';
pub const REQUEST_SUFFIX: &str = "REQ";
pub const RESPONSE_SUFFIX: &str = "RESP";
pub const META_ELEMENT: &str = "_meta";

/// Joins segments with the address separator.
pub fn build<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, segment) in segments.into_iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(segment.as_ref());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suffix {
    Request,
    Response,
}

impl Suffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suffix::Request => REQUEST_SUFFIX,
            Suffix::Response => RESPONSE_SUFFIX,
        }
    }
}

/// How the dispatcher treats a message arriving on an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    OperationRequest,
    OperationResponse,
    /// Property value or event emission; which one depends on the element.
    ElementUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub namespace: String,
    pub asset: String,
    pub submodel: String,
    pub element: String,
    pub suffix: Option<Suffix>,
}

impl Topic {
    pub fn element(namespace: &str, asset: &str, submodel: &str, element: &str) -> Self {
        Topic {
            namespace: namespace.to_string(),
            asset: asset.to_string(),
            submodel: submodel.to_string(),
            element: element.to_string(),
            suffix: None,
        }
    }

    pub fn with_suffix(mut self, suffix: Suffix) -> Self {
        self.suffix = Some(suffix);
        self
    }

    /// Parses an inbound address. Fewer than four segments, empty segments,
    /// and trailing segments other than a single `REQ`/`RESP` are rejected.
    pub fn parse(address: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidTopic {
            topic: address.to_string(),
            reason: reason.to_string(),
        };
        let segments: Vec<&str> = address.split(SEPARATOR).collect();
        if segments.len() < 4 {
            return Err(invalid("expected at least 4 segments"));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty segment"));
        }
        let suffix = match segments.len() {
            4 => None,
            5 => match segments[4] {
                REQUEST_SUFFIX => Some(Suffix::Request),
                RESPONSE_SUFFIX => Some(Suffix::Response),
                other => return Err(invalid(&format!("unexpected trailing segment '{}'", other))),
            },
            _ => return Err(invalid("too many segments")),
        };
        Ok(Topic {
            namespace: segments[0].to_string(),
            asset: segments[1].to_string(),
            submodel: segments[2].to_string(),
            element: segments[3].to_string(),
            suffix,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self.suffix {
            Some(Suffix::Request) => MessageKind::OperationRequest,
            Some(Suffix::Response) => MessageKind::OperationResponse,
            None => MessageKind::ElementUpdate,
        }
    }

    /// `namespace/asset`, the registry key.
    pub fn full_asset_name(&self) -> String {
        build([self.namespace.as_str(), self.asset.as_str()])
    }

    pub fn is_meta(&self) -> bool {
        self.suffix.is_none() && self.element == META_ELEMENT
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.asset, self.submodel, self.element
        )?;
        if let Some(suffix) = self.suffix {
            write!(f, "/{}", suffix.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether a segment may be used as a submodel or element name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(|c| c == SEPARATOR || c == '+' || c == '#')
}
