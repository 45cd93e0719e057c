//! Construction parameters shared by all map variants.

use crate::error::MapError;

/// Largest accepted initial capacity.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;
/// Capacity used by `MapConfig::default()`.
pub const DEFAULT_CAPACITY: usize = 16;
/// Load factor used by `MapConfig::default()`.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Most entries any table reserves before it holds data, whether asked
/// for by a config or by a source's size hint. Beyond this tables grow on
/// demand.
pub(crate) const MAX_UP_FRONT_RESERVE: usize = 1 << 16;

/// Validated sizing parameters.
///
/// `initial_capacity` is the number of buckets a table starts with and
/// `load_factor` the fraction of them that may fill before the table
/// grows; together they decide how many entries are reserved up front.
/// `shards` only matters for `ConcurrentHashMap`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapConfig {
    initial_capacity: usize,
    load_factor: f32,
    shards: usize,
}

impl MapConfig {
    pub fn new(initial_capacity: usize, load_factor: f32) -> Result<Self, MapError> {
        if initial_capacity > MAXIMUM_CAPACITY {
            return Err(MapError::InvalidArgument("initial capacity exceeds maximum"));
        }
        if !(load_factor > 0.0) || !load_factor.is_finite() {
            return Err(MapError::InvalidArgument(
                "load factor must be positive and finite",
            ));
        }
        Ok(Self {
            initial_capacity,
            load_factor,
            shards: default_shards(),
        })
    }

    /// Set the shard count of a concurrent map. Rounded up to a power of two.
    pub fn with_shards(mut self, shards: usize) -> Result<Self, MapError> {
        if shards == 0 {
            return Err(MapError::InvalidArgument("shard count must be non-zero"));
        }
        self.shards = shards
            .checked_next_power_of_two()
            .ok_or(MapError::InvalidArgument("shard count too large"))?;
        Ok(self)
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Entries to reserve at construction: what fits under the load
    /// factor, capped at `MAX_UP_FRONT_RESERVE`.
    pub(crate) fn reserved_entries(&self) -> usize {
        let n = (self.initial_capacity as f64 * self.load_factor as f64).ceil();
        (n as usize).min(MAX_UP_FRONT_RESERVE)
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            shards: default_shards(),
        }
    }
}

fn default_shards() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 4).next_power_of_two()
}
