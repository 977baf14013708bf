use framescope_media::demux::DEFAULT_MAX_BOX_SIZE;
use framescope_media::DemuxOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub demux: DemuxConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DemuxConfig {
    /// Bytes handed to the demuxer per append
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest MP4 box buffered before the file is rejected
    #[serde(default = "default_max_box_size")]
    pub max_box_size: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_box_size: default_max_box_size(),
        }
    }
}

impl DemuxConfig {
    pub fn to_options(&self, keep_box_tree: bool) -> DemuxOptions {
        DemuxOptions {
            max_box_size: self.max_box_size,
            keep_box_tree,
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_box_size() -> u64 {
    DEFAULT_MAX_BOX_SIZE
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Print reports as JSON
    #[serde(default)]
    pub json: bool,

    /// Include one row per frame
    #[serde(default)]
    pub frames: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter: Option<String>,
}
