//! Package manifests and their content hashes

use crate::errors::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// One package in a manifest
///
/// Written as `name=version` or `name=version[flavor]`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub flavor: String,
    /// when this build of the package was produced, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<u64>,
}

impl PackageSpec {
    pub fn new<N: Into<String>, V: Into<String>, F: Into<String>>(
        name: N,
        version: V,
        flavor: F,
    ) -> Self {
        PackageSpec {
            name: name.into(),
            version: version.into(),
            flavor: flavor.into(),
            build_time: None,
        }
    }

    pub fn with_build_time(mut self, build_time: u64) -> Self {
        self.build_time = Some(build_time);
        self
    }
}

impl FromStr for PackageSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^([^= \t\[\]]+)=([^= \t\[\]]+)(?:\[([^\[\]]*)\])?$").unwrap();
        }
        match RE.captures(s.trim()) {
            None => Err(Error::InvalidManifest(s.to_string())),
            Some(captures) => Ok(PackageSpec::new(
                &captures[1],
                &captures[2],
                captures.get(3).map(|m| m.as_str()).unwrap_or(""),
            )),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.version)?;
        if !self.flavor.is_empty() {
            write!(f, "[{}]", self.flavor)?;
        }
        Ok(())
    }
}

/// The set of packages that make up a root filesystem
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub packages: Vec<PackageSpec>,
}

impl Manifest {
    pub fn new(packages: Vec<PackageSpec>) -> Self {
        Manifest { packages }
    }

    /// Parse one `name=version[flavor]` entry per line, ignoring blanks and
    /// `#` comments
    pub fn parse_lines(text: &str) -> Result<Self, Error> {
        let packages = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Manifest::new(packages))
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Content hash of the manifest, independent of package order
    pub fn hash(&self) -> ManifestHash {
        let mut sorted: Vec<&PackageSpec> = self.packages.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut hasher = Sha256::new();
        for spec in sorted {
            hasher.update(spec.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(spec.version.as_bytes());
            hasher.update(b"\0");
            hasher.update(spec.flavor.as_bytes());
            hasher.update(b"\0");
            if let Some(build_time) = spec.build_time {
                hasher.update(build_time.to_string().as_bytes());
                hasher.update(b"\0");
            }
        }
        ManifestHash(format!("{:x}", hasher.finalize()))
    }
}

/// Hex-encoded SHA-256 identifying a manifest
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ManifestHash(String);

impl ManifestHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short prefix, for names with limited length
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for ManifestHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            Ok(ManifestHash(s.to_string()))
        } else {
            Err(Error::InvalidManifest(s.to_string()))
        }
    }
}

impl fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_spec() {
        let spec: PackageSpec = "group-os=1.0-1-1[is: x86_64]".parse().unwrap();
        assert_eq!(spec.name, "group-os");
        assert_eq!(spec.version, "1.0-1-1");
        assert_eq!(spec.flavor, "is: x86_64");
        assert_eq!(spec.to_string(), "group-os=1.0-1-1[is: x86_64]");

        let spec: PackageSpec = "bash=4.2".parse().unwrap();
        assert_eq!(spec.flavor, "");
        assert_eq!(spec.to_string(), "bash=4.2");

        assert!("bash".parse::<PackageSpec>().is_err());
        assert!("=4.2".parse::<PackageSpec>().is_err());
        assert!("bash=4.2[x".parse::<PackageSpec>().is_err());
    }

    #[test]
    fn hash_ignores_order() {
        let a = Manifest::parse_lines("a=1\nb=2[x]\n").unwrap();
        let b = Manifest::parse_lines("# comment\nb=2[x]\n\na=1\n").unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().as_str().len(), 64);
        let c = Manifest::parse_lines("a=1\nb=2[y]\n").unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn hash_is_stable() {
        let manifest = Manifest::new(vec![PackageSpec::new("a", "1", "")]);
        let mut hasher = Sha256::new();
        hasher.update(b"a\x001\x00\x00");
        assert_eq!(manifest.hash().as_str(), format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn hash_includes_build_times() {
        let plain = Manifest::new(vec![PackageSpec::new("a", "1", "")]);
        let timed = Manifest::new(vec![PackageSpec::new("a", "1", "").with_build_time(1234)]);
        assert_ne!(plain.hash(), timed.hash());
    }

    #[test]
    fn json() {
        let manifest = Manifest::from_json(
            r#"{"packages": [{"name": "a", "version": "1"}, {"name": "b", "version": "2", "flavor": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.packages[1].to_string(), "b=2[x]");
    }

    #[test]
    fn hash_from_str() {
        let hash = Manifest::default().hash();
        assert_eq!(hash.as_str().parse::<ManifestHash>().unwrap(), hash);
        assert!("xyz".parse::<ManifestHash>().is_err());
    }
}
