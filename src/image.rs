use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Image reference is empty")]
    Empty,
    #[error("Digest string '{0}' is not of the form 'sha256:<64 hex chars>'")]
    InvalidDigest(String),
    #[error("Invalid tag '{0}'")]
    InvalidTag(String),
    #[error("Invalid repository '{0}'")]
    InvalidRepository(String),
}

/// A content-addressed image digest.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// 256 bits of data as lowercase hex
    inner: [u8; 64],
}

impl Digest {
    pub fn parse(value: &str) -> Result<Self, ImageError> {
        let hash = value
            .strip_prefix("sha256:")
            .ok_or_else(|| ImageError::InvalidDigest(value.to_string()))?;
        let bytes = hash.as_bytes();
        if bytes.len() != 64 || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(ImageError::InvalidDigest(value.to_string()));
        }
        let mut inner = [0u8; 64];
        inner.copy_from_slice(bytes);
        inner.make_ascii_lowercase();
        Ok(Digest { inner })
    }

    /// The hex part of the digest, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        // Only ascii hex digits are ever stored
        std::str::from_utf8(&self.inner).unwrap_or_default()
    }

    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest(sha256:{})", self.hex())
    }
}

impl std::str::FromStr for Digest {
    type Err = ImageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A parsed image reference: `[registry[:port]/]path[:tag][@sha256:...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, ImageError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ImageError::Empty);
        }

        // Handle digest references (image@sha256:...)
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::parse(digest)?)),
            None => (image, None),
        };

        // Handle tag references (image:tag). A colon followed by a slash
        // belongs to a registry port (localhost:5000/myimage).
        let (repository, tag) = match rest.rfind(':') {
            Some(colon_pos) if !rest[colon_pos + 1..].contains('/') => {
                (&rest[..colon_pos], Some(&rest[colon_pos + 1..]))
            }
            _ => (rest, None),
        };

        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(ImageError::InvalidTag(tag.to_string()));
            }
        }
        if !is_valid_repository(repository) {
            return Err(ImageError::InvalidRepository(repository.to_string()));
        }

        Ok(ImageRef {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// The tag to pull when the reference is not digest-pinned.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The registry host this image is pulled from, if it names one.
    pub fn registry(&self) -> Option<&str> {
        let (first, _) = self.repository.split_once('/')?;
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }

    /// Reference that always resolves to exactly `digest`.
    pub fn pinned(&self, digest: &Digest) -> String {
        format!("{}@{}", self.repository, digest)
    }

    /// The same reference with its digest fixed to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        ImageRef {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    first_ok
        && tag.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !is_alnum(&bytes[0]) || !is_alnum(&bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|b| is_alnum(b) || matches!(b, b'.' | b'_' | b'-'))
}

fn is_valid_registry(host: &str) -> bool {
    let (name, port) = match host.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.parse::<u16>().is_ok());
    port_ok
        && !name.is_empty()
        && name
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

fn is_valid_repository(repository: &str) -> bool {
    let mut components: Vec<&str> = repository.split('/').collect();
    if components.len() > 1 {
        let first = components[0];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if !is_valid_registry(first) {
                return false;
            }
            components.remove(0);
        }
    }
    !components.is_empty() && components.into_iter().all(is_valid_path_component)
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageRef {
    type Err = ImageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageRef::parse(s)
    }
}

impl Serialize for ImageRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ImageRef::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "3f1c4e8a9b2d7f6e5a4c3b2a1f0e9d8c7b6a5f4e3d2c1b0a9f8e7d6c5b4a3f2e";

    #[test]
    fn test_parse_plain_name_defaults_to_latest() {
        let image = ImageRef::parse("nginx").unwrap();
        assert_eq!(image.repository, "nginx");
        assert_eq!(image.tag, None);
        assert_eq!(image.tag_or_latest(), "latest");
        assert_eq!(image.registry(), None);
    }

    #[test]
    fn test_parse_registry_with_port_and_tag() {
        let image = ImageRef::parse("localhost:5000/team/backend:v1.2.3").unwrap();
        assert_eq!(image.repository, "localhost:5000/team/backend");
        assert_eq!(image.tag.as_deref(), Some("v1.2.3"));
        assert_eq!(image.registry(), Some("localhost:5000"));
    }

    #[test]
    fn test_parse_registry_port_without_tag() {
        let image = ImageRef::parse("localhost:5000/backend").unwrap();
        assert_eq!(image.repository, "localhost:5000/backend");
        assert_eq!(image.tag, None);
    }

    #[test]
    fn test_parse_digest_reference() {
        let raw = format!("ghcr.io/acme/frontend:main@sha256:{HEX}");
        let image = ImageRef::parse(&raw).unwrap();
        assert_eq!(image.repository, "ghcr.io/acme/frontend");
        assert_eq!(image.tag.as_deref(), Some("main"));
        assert_eq!(image.digest.unwrap().hex(), HEX);
        assert_eq!(image.to_string(), raw);
    }

    #[test]
    fn test_rejects_malformed_references() {
        assert_eq!(ImageRef::parse("  "), Err(ImageError::Empty));
        assert!(matches!(
            ImageRef::parse("Acme/App:1"),
            Err(ImageError::InvalidRepository(_))
        ));
        assert!(matches!(
            ImageRef::parse("acme/app:-bad"),
            Err(ImageError::InvalidTag(_))
        ));
        assert!(matches!(
            ImageRef::parse("acme/app@sha256:abc"),
            Err(ImageError::InvalidDigest(_))
        ));
        assert!(matches!(
            ImageRef::parse("acme//app"),
            Err(ImageError::InvalidRepository(_))
        ));
        assert!(matches!(
            ImageRef::parse("acme/app with space"),
            Err(ImageError::InvalidRepository(_)) | Err(ImageError::InvalidTag(_))
        ));
    }

    #[test]
    fn test_digest_is_normalized_to_lowercase() {
        let upper = format!("sha256:{}", HEX.to_ascii_uppercase());
        let digest = Digest::parse(&upper).unwrap();
        assert_eq!(digest.to_string(), format!("sha256:{HEX}"));
        assert_eq!(digest.short(), &HEX[..12]);
    }

    #[test]
    fn test_pinned_reference_drops_tag() {
        let digest = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        let image = ImageRef::parse("acme/backend:latest").unwrap();
        assert_eq!(image.pinned(&digest), format!("acme/backend@sha256:{HEX}"));
    }
}
