// Copyright © 2024 The Kestrel Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Declarative machine configuration.
//!
//! A machine is described by a JSON document: the core attributes
//! (`memory`, `vcpu`, `bios`, `debug`) plus a flat list of objects,
//! each naming a device class and optional parent. Object attributes
//! other than `class`/`name`/`parent` are opaque to the core and are
//! handed to the device constructor untouched.

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open config file {0}: {1}")]
    OpenFile(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseFile(#[source] serde_json::Error),

    #[error("Invalid memory size: {0}")]
    ParseMemory(String),

    #[error("At least one vCPU is required")]
    NoVcpus,

    #[error("Too many vCPUs requested: {0}")]
    TooManyVcpus(u32),

    #[error("Object #{0} has an empty class name")]
    EmptyClass(usize),

    #[error("Duplicate object name: {0}")]
    DuplicateObjectName(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound carried over from the in-kernel interrupt chip, which
/// only addresses 255 local APICs.
pub const MAX_VCPUS: u32 = 255;

/// One node of the configured object tree.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectConfig {
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    /// Device specific attributes, passed through uninterpreted.
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ObjectConfig {
    /// The instance name: explicit `name`, or the class name for
    /// singletons.
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MachineConfig {
    /// Guest RAM size, e.g. "512M" or "4G".
    pub memory: String,
    /// Number of vCPUs.
    pub vcpu: u32,
    /// Firmware image mapped below 1MiB and below 4GiB.
    pub bios: PathBuf,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

impl MachineConfig {
    pub fn parse_file(path: &Path) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| Error::OpenFile(path.to_path_buf(), e))?;
        let config: MachineConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(Error::ParseFile)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vcpu == 0 {
            return Err(Error::NoVcpus);
        }
        if self.vcpu > MAX_VCPUS {
            return Err(Error::TooManyVcpus(self.vcpu));
        }
        self.ram_size()?;
        for (i, object) in self.objects.iter().enumerate() {
            if object.class.is_empty() {
                return Err(Error::EmptyClass(i));
            }
        }
        let mut names: Vec<&str> = self.objects.iter().map(|o| o.instance_name()).collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(Error::DuplicateObjectName(pair[0].to_string()));
            }
        }
        Ok(())
    }

    /// Guest RAM size in bytes.
    pub fn ram_size(&self) -> Result<u64> {
        parse_size(&self.memory).ok_or_else(|| Error::ParseMemory(self.memory.clone()))
    }
}

/// Parses a size string with an optional K/M/G/T binary suffix.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, shift) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 10),
        b'M' => (&s[..s.len() - 1], 20),
        b'G' => (&s[..s.len() - 1], 30),
        b'T' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_shl(shift).filter(|v| *v >> shift == value || value == 0)
}
