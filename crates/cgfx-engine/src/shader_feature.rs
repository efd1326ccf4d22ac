//! Named shader feature bits.
//!
//! Feature strings such as `"Depth|Alpha"` are turned into bit masks that
//! select a shader program variant. A name gets the next free bit the first
//! time it is seen, so masks depend on registration order and are only
//! meaningful within one process.

use std::collections::HashMap;

use tracing::trace;

pub type ShaderFeatureMask = u64;

pub const MAX_SHADER_FEATURES: usize = ShaderFeatureMask::BITS as usize;

#[derive(Debug, Default)]
pub struct ShaderFeatureRegistry {
    bits: HashMap<String, u32>,
    names: Vec<String>,
}

fn tokens(features: &str) -> impl Iterator<Item = &str> {
    features
        .split(['|', ' ', '\t'])
        .filter(|token| !token.is_empty())
}

impl ShaderFeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask for a `|`, space or tab separated list of feature names,
    /// registering any name not seen before.
    #[track_caller]
    pub fn string_to_mask(&mut self, features: &str) -> ShaderFeatureMask {
        let mut mask = 0;
        for token in tokens(features) {
            mask |= 1 << self.register(token);
        }
        mask
    }

    /// Mask for already registered names only; unknown names are ignored.
    pub fn lookup_mask(&self, features: &str) -> ShaderFeatureMask {
        tokens(features)
            .filter_map(|token| self.bits.get(token))
            .fold(0, |mask, bit| mask | 1 << bit)
    }

    /// Names of the set bits, lowest bit first, joined by `|`.
    pub fn mask_to_string(&self, mask: ShaderFeatureMask) -> String {
        self.names
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    #[track_caller]
    fn register(&mut self, name: &str) -> u32 {
        if let Some(&bit) = self.bits.get(name) {
            return bit;
        }
        assert!(
            self.names.len() < MAX_SHADER_FEATURES,
            "cannot register shader feature '{}': all {} bits are taken",
            name,
            MAX_SHADER_FEATURES
        );
        let bit = self.names.len() as u32;
        self.bits.insert(name.to_string(), bit);
        self.names.push(name.to_string());
        trace!(feature = name, bit, "shader feature registered");
        bit
    }

    pub fn bit_of(&self, name: &str) -> Option<u32> {
        self.bits.get(name).copied()
    }

    pub fn name_of(&self, bit: u32) -> Option<&str> {
        self.names.get(bit as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
