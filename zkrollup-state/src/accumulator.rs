//! Keyed Merkle accumulator.
//!
//! A sparse binary Merkle tree of fixed depth `D` mapping keys to values.
//! A key's leaf index is derived from a hash of the key, so the commitment
//! depends only on the stored (key, value) pairs and never on insertion order.
//!
//! ```text
//!                      root (level D)
//!                 /                  \
//!            node(D-1, 0)        node(D-1, 1)
//!               ...                  ...
//!   leaf 0  leaf 1  ...  leaf i = H(leaf_v1 || key || value)  ...  leaf 2^D-1
//! ```
//!
//! Absent leaves hash to [`Commitment::ZERO`]; an all-empty subtree of height
//! `l` hashes to `zeros[l]`, so only non-empty nodes are stored.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::commitment::{CanonicalFields, Commitment, FieldEncoder, LEAF_DOMAIN};
use crate::error::ConfigurationError;

/// Depth used for the rollup account database.
pub const ACCOUNT_DB_DEPTH: u8 = 32;

/// Deepest supported tree (leaf indices are 64-bit).
pub const MAX_DEPTH: u8 = 64;

const KEY_INDEX_DOMAIN: &[u8] = b"zkrollup_key_index_v1";

/// Leaf index of `key` in a tree of the given depth.
pub fn key_index<K: CanonicalFields + ?Sized>(key: &K, depth: u8) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_INDEX_DOMAIN);
    hasher.update(&key.to_field_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    let raw = u64::from_le_bytes(prefix);

    if depth >= MAX_DEPTH {
        raw
    } else {
        raw & ((1u64 << depth) - 1)
    }
}

/// Hash of an occupied leaf.
pub fn leaf_hash<K, V>(key: &K, value: &V) -> Commitment
where
    K: CanonicalFields + ?Sized,
    V: CanonicalFields + ?Sized,
{
    struct Leaf<'a, K: ?Sized, V: ?Sized>(&'a K, &'a V);

    impl<K: CanonicalFields + ?Sized, V: CanonicalFields + ?Sized> CanonicalFields for Leaf<'_, K, V> {
        fn write_fields(&self, out: &mut FieldEncoder) {
            out.field(self.0).field(self.1);
        }
    }

    Commitment::of(LEAF_DOMAIN, &Leaf(key, value))
}

/// Result of a lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership<V> {
    /// Whether the key is stored.
    pub present: bool,
    /// The stored value, or the accumulator's default when absent.
    pub value: V,
}

/// Opaque handle to a key's leaf, usable by [`KeyedAccumulator::set`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position<K> {
    index: u64,
    depth: u8,
    key: K,
}

impl<K> Position<K> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

/// Sibling path from a leaf up to the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleWitness {
    pub index: u64,
    /// `siblings[l]` is the sibling at level `l` (0 = leaf level).
    pub siblings: Vec<Commitment>,
}

impl MerkleWitness {
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    /// Root obtained by placing `leaf` at this witness's index.
    pub fn root_with(&self, leaf: Commitment) -> Commitment {
        let mut current = leaf;
        let mut index = self.index;
        for sibling in &self.siblings {
            current = if index & 1 == 0 {
                Commitment::node(&current, sibling)
            } else {
                Commitment::node(sibling, &current)
            };
            index >>= 1;
        }
        current
    }
}

impl CanonicalFields for MerkleWitness {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.u64(self.index).u32(self.siblings.len() as u32);
        for sibling in &self.siblings {
            out.field(sibling);
        }
    }
}

/// Stable persisted form of an accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorLayout {
    pub depth: u8,
    pub root: Commitment,
    /// Highest occupied leaf index, if any leaf is occupied.
    pub last_index: Option<u64>,
}

/// Persistent Merkle map from keys to values.
///
/// Mutation must be serialized by a single writer.
#[derive(Clone, Debug)]
pub struct KeyedAccumulator<K, V> {
    depth: u8,
    zeros: Vec<Commitment>,
    nodes: HashMap<(u8, u64), Commitment>,
    leaves: BTreeMap<u64, (K, V)>,
    default: V,
}

impl<K, V> KeyedAccumulator<K, V>
where
    K: CanonicalFields + Clone + PartialEq,
    V: CanonicalFields + Clone,
{
    /// Empty accumulator returning `V::default()` for absent keys.
    pub fn new(depth: u8) -> Result<Self, ConfigurationError>
    where
        V: Default,
    {
        Self::with_default(depth, V::default())
    }

    /// Empty accumulator returning `default` for absent keys.
    pub fn with_default(depth: u8, default: V) -> Result<Self, ConfigurationError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(ConfigurationError::UnsupportedDepth(depth));
        }

        let mut zeros = Vec::with_capacity(depth as usize + 1);
        zeros.push(Commitment::ZERO);
        for level in 1..=depth as usize {
            let below = zeros[level - 1];
            zeros.push(Commitment::node(&below, &below));
        }

        Ok(Self {
            depth,
            zeros,
            nodes: HashMap::new(),
            leaves: BTreeMap::new(),
            default,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Root digest over all stored pairs.
    pub fn commitment(&self) -> Commitment {
        self.node(self.depth, 0)
    }

    pub fn layout(&self) -> AccumulatorLayout {
        AccumulatorLayout {
            depth: self.depth,
            root: self.commitment(),
            last_index: self.leaves.keys().next_back().copied(),
        }
    }

    /// Look up `key`.
    ///
    /// Absent keys yield `present = false` and the default value. The returned
    /// position can be passed to [`set`](Self::set) either way.
    pub fn get(&self, key: &K) -> Result<(Membership<V>, Position<K>), ConfigurationError> {
        let index = key_index(key, self.depth);
        let position = Position {
            index,
            depth: self.depth,
            key: key.clone(),
        };

        let membership = match self.leaves.get(&index) {
            Some((stored, value)) if stored == key => Membership {
                present: true,
                value: value.clone(),
            },
            Some(_) => return Err(ConfigurationError::KeyCollision { index }),
            None => Membership {
                present: false,
                value: self.default.clone(),
            },
        };

        Ok((membership, position))
    }

    /// Overwrite the leaf at `position` and return the new root.
    pub fn set(&mut self, position: &Position<K>, value: V) -> Result<Commitment, ConfigurationError> {
        self.check_position(position)?;

        let hash = leaf_hash(&position.key, &value);
        self.leaves
            .insert(position.index, (position.key.clone(), value));
        Ok(self.update_path(position.index, hash))
    }

    /// Put the leaf at `position` back to `previous` (`None` empties it).
    pub fn restore(
        &mut self,
        position: &Position<K>,
        previous: Option<V>,
    ) -> Result<Commitment, ConfigurationError> {
        match previous {
            Some(value) => self.set(position, value),
            None => {
                self.check_position(position)?;
                self.leaves.remove(&position.index);
                Ok(self.update_path(position.index, Commitment::ZERO))
            }
        }
    }

    /// Sibling path for the leaf at `position` under the current root.
    pub fn witness(&self, position: &Position<K>) -> Result<MerkleWitness, ConfigurationError> {
        if position.depth != self.depth {
            return Err(ConfigurationError::DepthMismatch {
                position: position.depth,
                accumulator: self.depth,
            });
        }

        let mut index = position.index;
        let mut siblings = Vec::with_capacity(self.depth as usize);
        for level in 0..self.depth {
            siblings.push(self.node(level, index ^ 1));
            index >>= 1;
        }

        Ok(MerkleWitness {
            index: position.index,
            siblings,
        })
    }

    /// Stored pairs in leaf index order.
    pub fn entries(&self) -> impl Iterator<Item = (&K, &V)> {
        self.leaves.values().map(|(k, v)| (k, v))
    }

    fn check_position(&self, position: &Position<K>) -> Result<(), ConfigurationError> {
        if position.depth != self.depth {
            return Err(ConfigurationError::DepthMismatch {
                position: position.depth,
                accumulator: self.depth,
            });
        }
        match self.leaves.get(&position.index) {
            Some((stored, _)) if *stored != position.key => Err(ConfigurationError::KeyCollision {
                index: position.index,
            }),
            _ => Ok(()),
        }
    }

    fn node(&self, level: u8, index: u64) -> Commitment {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.zeros[level as usize])
    }

    fn store(&mut self, level: u8, index: u64, hash: Commitment) {
        if hash == self.zeros[level as usize] {
            self.nodes.remove(&(level, index));
        } else {
            self.nodes.insert((level, index), hash);
        }
    }

    fn update_path(&mut self, index: u64, leaf: Commitment) -> Commitment {
        let mut current = leaf;
        let mut index = index;
        self.store(0, index, current);

        for level in 0..self.depth {
            let sibling = self.node(level, index ^ 1);
            current = if index & 1 == 0 {
                Commitment::node(&current, &sibling)
            } else {
                Commitment::node(&sibling, &current)
            };
            index >>= 1;
            self.store(level + 1, index, current);
        }

        log::trace!("accumulator root -> {}", current);
        current
    }
}
