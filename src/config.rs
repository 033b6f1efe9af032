//! Stream configuration

use crate::chunk::Encoding;
use crate::error::Result;

/// Default high-water mark in bytes
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default high-water mark in object mode (counted in chunks)
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Upper bound for dynamic high-water-mark growth
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// Options shared by sinks and sources
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Buffered length at which backpressure is signalled
    /// (None = default for the mode)
    pub high_water_mark: Option<usize>,

    /// Treat every chunk as length 1 and accept arbitrary values
    pub object_mode: bool,

    /// Encoding applied to text chunks written without one
    pub default_encoding: Encoding,

    /// Convert text chunks to bytes before they reach the write hook
    pub decode_strings: bool,

    /// Emit `close` once the stream is destroyed
    pub emit_close: bool,

    /// Destroy the stream automatically after `finish` / `end`
    pub auto_destroy: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            default_encoding: Encoding::Utf8,
            decode_strings: false,
            emit_close: true,
            auto_destroy: true,
        }
    }
}

impl StreamConfig {
    /// Create a config for object mode streams
    pub fn objects() -> Self {
        Self {
            object_mode: true,
            ..Default::default()
        }
    }

    /// Set the high-water mark
    pub fn high_water_mark(mut self, units: usize) -> Self {
        self.high_water_mark = Some(units);
        self
    }

    /// Enable or disable object mode
    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    /// Set the default encoding
    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// Set the default encoding by name
    pub fn default_encoding_name(mut self, name: &str) -> Result<Self> {
        self.default_encoding = name.parse()?;
        Ok(self)
    }

    /// Convert text chunks to bytes on write
    pub fn decode_strings(mut self, enabled: bool) -> Self {
        self.decode_strings = enabled;
        self
    }

    /// Emit `close` after destruction
    pub fn emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    /// Destroy automatically once the stream completes
    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    /// Effective high-water mark for this config
    pub fn resolved_high_water_mark(&self) -> usize {
        match self.high_water_mark {
            Some(units) => units,
            None if self.object_mode => DEFAULT_OBJECT_HIGH_WATER_MARK,
            None => DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Per-half options for duplex and transform streams
#[derive(Debug, Clone, Default)]
pub struct DuplexConfig {
    /// Options for the source (readable) half
    pub readable: StreamConfig,
    /// Options for the sink (writable) half
    pub writable: StreamConfig,
}

impl DuplexConfig {
    /// Use different options for each half
    pub fn split(readable: StreamConfig, writable: StreamConfig) -> Self {
        Self { readable, writable }
    }
}

impl From<StreamConfig> for DuplexConfig {
    fn from(config: StreamConfig) -> Self {
        Self {
            readable: config.clone(),
            writable: config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();

        assert_eq!(config.resolved_high_water_mark(), 16 * 1024);
        assert!(!config.object_mode);
        assert_eq!(config.default_encoding, Encoding::Utf8);
        assert!(!config.decode_strings);
        assert!(config.emit_close);
        assert!(config.auto_destroy);
    }

    #[test]
    fn test_object_mode_default_high_water_mark() {
        assert_eq!(StreamConfig::objects().resolved_high_water_mark(), 16);
        assert_eq!(
            StreamConfig::objects()
                .high_water_mark(4)
                .resolved_high_water_mark(),
            4
        );
    }

    #[test]
    fn test_builder_chaining() {
        let config = StreamConfig::default()
            .high_water_mark(10)
            .decode_strings(true)
            .emit_close(false)
            .auto_destroy(false)
            .default_encoding(Encoding::Hex);

        assert_eq!(config.high_water_mark, Some(10));
        assert!(config.decode_strings);
        assert!(!config.emit_close);
        assert!(!config.auto_destroy);
        assert_eq!(config.default_encoding, Encoding::Hex);
    }

    #[test]
    fn test_default_encoding_name() {
        let config = StreamConfig::default().default_encoding_name("latin1").unwrap();
        assert_eq!(config.default_encoding, Encoding::Latin1);

        let err = StreamConfig::default().default_encoding_name("klingon");
        assert!(matches!(err, Err(StreamError::InvalidEncoding(_))));
    }

    #[test]
    fn test_duplex_config_from_single() {
        let config: DuplexConfig = StreamConfig::objects().into();
        assert!(config.readable.object_mode);
        assert!(config.writable.object_mode);

        let split = DuplexConfig::split(StreamConfig::objects(), StreamConfig::default());
        assert!(split.readable.object_mode);
        assert!(!split.writable.object_mode);
    }
}
