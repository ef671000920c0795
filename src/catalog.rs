//! Stream catalog
//!
//! Resolves path-style stream names to their numeric keys, compiled schema and
//! quota settings. The `[[streams]]` table of the configuration is the
//! authoritative store; resolutions are served from a [`MetadataCache`] keyed
//! by stream ID.

use crate::cache::MetadataCache;
use crate::config::{Config, StreamConfig};
use crate::storage::{Schema, StorageError, StorageResult, StreamKey};
use crate::stream::InsertOptions;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// A resolved stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDef {
    pub name: String,
    pub device: i64,
    pub stream: i64,
    pub schema: Schema,
    pub max_device_size: u64,
    pub max_stream_size: u64,
    pub restamp: bool,
}

impl StreamDef {
    fn compile(config: &StreamConfig) -> StorageResult<Self> {
        let schema = match &config.schema {
            Some(text) => Schema::parse(text).map_err(|e| {
                StorageError::Config(format!("stream {:?}: bad schema: {}", config.name, e))
            })?,
            None => Schema::any(),
        };

        Ok(Self {
            name: config.name.clone(),
            device: config.device,
            stream: config.stream,
            schema,
            max_device_size: config.max_device_size,
            max_stream_size: config.max_stream_size,
            restamp: config.restamp,
        })
    }

    /// Key of the primary substream, or of `substream` when given
    pub fn key(&self, substream: Option<&str>) -> StreamKey {
        match substream {
            Some(sub) => StreamKey::substream(self.device, self.stream, sub),
            None => StreamKey::new(self.device, self.stream),
        }
    }

    pub fn insert_options(&self) -> InsertOptions {
        InsertOptions::new()
            .schema(self.schema.clone())
            .restamp(self.restamp)
            .max_device_size(self.max_device_size)
            .max_stream_size(self.max_stream_size)
    }
}

/// Partial update of a stream definition
///
/// Only the fields that are set change. Every field is checked before any is
/// applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamPatch {
    /// `Some(None)` removes the schema
    pub schema: Option<Option<String>>,
    pub max_device_size: Option<u64>,
    pub max_stream_size: Option<u64>,
    pub restamp: Option<bool>,
}

impl StreamPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn validate(&self) -> StorageResult<()> {
        if let Some(Some(text)) = &self.schema {
            Schema::parse(text)?;
        }
        if let (Some(device), Some(stream)) = (self.max_device_size, self.max_stream_size) {
            if device > 0 && stream > device {
                return Err(StorageError::Validation(format!(
                    "max_stream_size {} exceeds max_device_size {}",
                    stream, device
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, config: &mut StreamConfig) {
        if let Some(schema) = &self.schema {
            config.schema = schema.clone();
        }
        if let Some(size) = self.max_device_size {
            config.max_device_size = size;
        }
        if let Some(size) = self.max_stream_size {
            config.max_stream_size = size;
        }
        if let Some(restamp) = self.restamp {
            config.restamp = restamp;
        }
    }
}

/// Name resolution for configured streams
pub struct StreamCatalog {
    streams: RwLock<HashMap<String, StreamConfig>>,
    cache: MetadataCache<StreamDef>,
}

impl StreamCatalog {
    pub fn new(config: &Config) -> StorageResult<Self> {
        let mut streams = HashMap::with_capacity(config.streams.len());
        let mut ids = HashSet::with_capacity(config.streams.len());
        for stream in &config.streams {
            // Reject broken schemas at startup rather than on first insert
            StreamDef::compile(stream)?;
            // Cached definitions are keyed by stream ID alone
            if !ids.insert(stream.stream) {
                return Err(StorageError::Config(format!(
                    "stream id {} used by more than one stream",
                    stream.stream
                )));
            }
            if streams.insert(stream.name.clone(), stream.clone()).is_some() {
                return Err(StorageError::Config(format!(
                    "stream {:?} declared twice",
                    stream.name
                )));
            }
        }

        Ok(Self {
            streams: RwLock::new(streams),
            cache: MetadataCache::new(config.metadata.capacity, config.metadata.ttl()),
        })
    }

    /// Resolve a stream by name
    pub fn resolve(&self, name: &str) -> StorageResult<StreamDef> {
        if let Some(def) = self.cache.get_by_name(name) {
            return Ok(def);
        }

        let config = self
            .streams
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::StreamNotFound(name.to_string()))?;

        let def = StreamDef::compile(&config)?;
        self.cache.set(name, def.stream, def.clone());
        tracing::debug!(stream = name, id = def.stream, "Resolved stream");
        Ok(def)
    }

    /// Resolve a stream by its numeric ID
    pub fn resolve_id(&self, id: i64) -> StorageResult<StreamDef> {
        if let Some(def) = self.cache.get_by_id(id) {
            return Ok(def);
        }

        let config = self
            .streams
            .read()?
            .values()
            .find(|s| s.stream == id)
            .cloned()
            .ok_or_else(|| StorageError::StreamNotFound(format!("id {}", id)))?;

        let def = StreamDef::compile(&config)?;
        self.cache.set(&def.name, id, def.clone());
        Ok(def)
    }

    /// Apply a partial update, returning the new definition
    pub fn update(&self, name: &str, patch: &StreamPatch) -> StorageResult<StreamDef> {
        patch.validate()?;

        let def = {
            let mut streams = self.streams.write()?;
            let config = streams
                .get_mut(name)
                .ok_or_else(|| StorageError::StreamNotFound(name.to_string()))?;

            let mut updated = config.clone();
            patch.apply(&mut updated);
            let def = StreamDef::compile(&updated)?;
            *config = updated;
            def
        };

        self.cache.update(def.stream, def.clone());
        tracing::info!(stream = name, "Updated stream definition");
        Ok(def)
    }

    /// Forget a stream
    pub fn remove(&self, name: &str) -> StorageResult<()> {
        self.streams.write()?.remove(name);
        self.cache.remove_name(name);
        Ok(())
    }

    /// Drop cached resolutions for every name under `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.cache.unlink_name_prefix(prefix);
    }

    /// Configured stream names, sorted
    pub fn names(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.streams.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
