use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fmt,
    str::FromStr,
};

use crate::error::RecipeError;

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest(pub String);

impl Digest {
    pub fn hex(&self) -> &str {
        self.0.splitn(2, ':').nth(1).unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey(pub String);

/// A reference to an image as `name[:tag][@digest]`.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl FromStr for ImageRef {
    type Err = RecipeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(RecipeError::InvalidImageRef(value.into()));
        }

        let (rest, digest) = match value.find('@') {
            Some(index) => (&value[..index], Some(value[index + 1..].to_string())),
            None => (value, None),
        };

        // A colon before the last slash belongs to a registry port.
        let last_slash = rest.rfind('/').map(|index| index + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].find(':') {
            Some(index) => {
                let split = last_slash + index;
                (&rest[..split], &rest[split + 1..])
            }
            None => (rest, "latest"),
        };

        if name.is_empty() || tag.is_empty() || digest.as_deref() == Some("") {
            return Err(RecipeError::InvalidImageRef(value.into()));
        }

        Ok(ImageRef {
            name: name.into(),
            tag: tag.into(),
            digest,
        })
    }
}

impl std::convert::TryFrom<String> for ImageRef {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageRef> for String {
    fn from(reference: ImageRef) -> String {
        reference.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// An exposed container port, written as `8000` or `8000/udp`.
#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn tcp(number: u16) -> Port {
        Port {
            number,
            protocol: Protocol::Tcp,
        }
    }
}

impl FromStr for Port {
    type Err = RecipeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || RecipeError::InvalidPort(value.into());

        let (number, protocol) = match value.trim().split_once('/') {
            Some((number, "tcp")) => (number, Protocol::Tcp),
            Some((number, "udp")) => (number, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (value.trim(), Protocol::Tcp),
        };

        match number.parse::<u16>() {
            Ok(0) | Err(_) => Err(invalid()),
            Ok(number) => Ok(Port { number, protocol }),
        }
    }
}

impl std::convert::TryFrom<String> for Port {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> String {
        port.to_string()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.number, protocol)
    }
}

/// Runtime metadata carried by an image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub env: Map<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub exposed_ports: Set<Port>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub labels: Map<String, String>,
}

impl ImageConfig {
    /// Environment in the `KEY=value` form containers expect.
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
    pub reference: ImageRef,
    pub id: ImageId,
    pub config: ImageConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub digest: Digest,
    /// sha256 of the uncompressed tarball, as container runtimes address layers.
    pub diff_id: String,
    pub size: u64,
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,
    #[serde(default)]
    pub empty_layer: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub base: BaseImage,
    pub config: ImageConfig,
    pub layers: Vec<LayerRecord>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_references() {
        let reference: ImageRef = "python:3.12-slim".parse().unwrap();
        assert_eq!(reference.name, "python");
        assert_eq!(reference.tag, "3.12-slim");
        assert_eq!(reference.digest, None);

        let reference: ImageRef = "registry.local:5000/team/app".parse().unwrap();
        assert_eq!(reference.name, "registry.local:5000/team/app");
        assert_eq!(reference.tag, "latest");

        let reference: ImageRef = "python:3.12@sha256:abc".parse().unwrap();
        assert_eq!(reference.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(reference.to_string(), "python:3.12@sha256:abc");

        assert!("".parse::<ImageRef>().is_err());
        assert!("python 3".parse::<ImageRef>().is_err());
        assert!("python:".parse::<ImageRef>().is_err());
    }

    #[test]
    fn parses_ports() {
        assert_eq!("8000".parse::<Port>().unwrap(), Port::tcp(8000));
        assert_eq!("8000".parse::<Port>().unwrap().to_string(), "8000/tcp");
        assert_eq!(
            "53/udp".parse::<Port>().unwrap().protocol,
            Protocol::Udp
        );
        assert!("0".parse::<Port>().is_err());
        assert!("70000".parse::<Port>().is_err());
        assert!("80/sctp".parse::<Port>().is_err());
    }
}
