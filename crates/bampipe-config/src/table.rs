use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use bampipe_backend::{BamType, Direction, MemoryType, PeerRole};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LoadLimits;
use crate::error::{ConfigError, Result};
use crate::schema::validate_document;

/// Static description of one pipe, fixed at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeDescriptor {
    pub label: String,
    pub mem_type: MemoryType,
    pub bam: BamType,
    pub peer: PeerRole,
    pub dir: Direction,
    pub pipe_num: u8,
    #[serde(default)]
    pub src_phys_addr: u32,
    #[serde(default)]
    pub src_pipe_index: u32,
    #[serde(default)]
    pub dst_phys_addr: u32,
    #[serde(default)]
    pub dst_pipe_index: u32,
    #[serde(default)]
    pub data_fifo_offset: u32,
    pub data_fifo_size: u32,
    #[serde(default)]
    pub desc_fifo_offset: u32,
    pub desc_fifo_size: u32,
    #[serde(default)]
    pub reset_on_connect: bool,
}

impl PipeDescriptor {
    /// The local controller's pipe index for this direction.
    pub fn local_pipe_index(&self) -> u32 {
        match self.dir {
            Direction::LocalToPeer => self.src_pipe_index,
            Direction::PeerToLocal => self.dst_pipe_index,
        }
    }

    /// Physical address of the local controller's bus instance.
    pub fn local_phys_addr(&self) -> u32 {
        match self.dir {
            Direction::LocalToPeer => self.src_phys_addr,
            Direction::PeerToLocal => self.dst_phys_addr,
        }
    }

    /// Whether the descriptor matches a `(bam, peer, dir, pipe_num)` selector.
    pub fn matches(&self, bam: BamType, peer: PeerRole, dir: Direction, pipe_num: u8) -> bool {
        self.bam == bam && self.peer == peer && self.dir == dir && self.pipe_num == pipe_num
    }
}

/// Ordered pipe table plus controller-wide properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeTable {
    /// Number of hardware pipes each bus instance exposes.
    pub num_pipes: u32,
    /// Base of the fixed FIFO window used by private and off-chip pipes.
    #[serde(default)]
    pub fifo_base_addr: u32,
    #[serde(default)]
    pub ignore_core_reset_ack: bool,
    #[serde(default)]
    pub disable_clk_gating: bool,
    /// Bus instance carrying trace data, if any.
    #[serde(default)]
    pub qdss_core: Option<BamType>,
    pub pipes: Vec<PipeDescriptor>,
}

impl PipeTable {
    /// Parse and validate a table from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_json_str_with_limits(json, LoadLimits::default())
    }

    /// Parse and validate a table from a JSON string with explicit limits.
    pub fn from_json_str_with_limits(json: &str, limits: LoadLimits) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        validate_document(&value)?;
        let table: PipeTable = serde_json::from_value(value)?;
        table.validate(&limits)?;
        debug!(pipes = table.pipes.len(), "pipe table loaded");
        Ok(table)
    }

    /// Load a table from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_limits(path, LoadLimits::default())
    }

    /// Load a table from a file with explicit limits.
    pub fn from_file_with_limits(path: &Path, limits: LoadLimits) -> Result<Self> {
        let read_err = |source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::open(path).map_err(read_err)?;
        let size = file.metadata().map_err(read_err)?.len();
        if size > limits.max_file_size as u64 {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                size,
                max: limits.max_file_size,
            });
        }

        let read_limit = u64::try_from(limits.max_file_size.saturating_add(1)).unwrap_or(u64::MAX);
        let mut content = String::new();
        file.take(read_limit)
            .read_to_string(&mut content)
            .map_err(read_err)?;
        if content.len() > limits.max_file_size {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
                size: content.len() as u64,
                max: limits.max_file_size,
            });
        }

        Self::from_json_str_with_limits(&content, limits)
    }

    /// Cross-field checks the schema cannot express.
    pub fn validate(&self, limits: &LoadLimits) -> Result<()> {
        if self.pipes.is_empty() {
            return Err(ConfigError::Semantic("pipe table is empty".into()));
        }
        if self.pipes.len() > limits.max_pipes {
            return Err(ConfigError::Semantic(format!(
                "{} pipes exceed the limit of {}",
                self.pipes.len(),
                limits.max_pipes
            )));
        }

        let mut selectors = HashSet::new();
        for pipe in &self.pipes {
            if matches!(pipe.mem_type, MemoryType::Private | MemoryType::OffChip)
                && self.fifo_base_addr == 0
            {
                return Err(ConfigError::Semantic(format!(
                    "pipe '{}' uses fixed FIFO memory but fifo_base_addr is missing",
                    pipe.label
                )));
            }
            if !selectors.insert((pipe.bam, pipe.peer, pipe.dir, pipe.pipe_num)) {
                return Err(ConfigError::Semantic(format!(
                    "pipe '{}' duplicates selector ({}, {:?}, {:?}, {})",
                    pipe.label, pipe.bam, pipe.peer, pipe.dir, pipe.pipe_num
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Whether any pipe of `bam` asks for a device reset before the first connect.
    pub fn reset_on_connect(&self, bam: BamType) -> bool {
        self.pipes
            .iter()
            .any(|pipe| pipe.bam == bam && pipe.reset_on_connect)
    }

    /// Bus instances that carry at least one pipe, in index order.
    pub fn instances(&self) -> Vec<BamType> {
        BamType::ALL
            .into_iter()
            .filter(|bam| self.pipes.iter().any(|pipe| pipe.bam == *bam))
            .collect()
    }
}
