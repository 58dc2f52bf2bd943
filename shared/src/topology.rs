// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Topology layers and the transition legality matrix.
//!
//! A layer names the runtime region that owns a calling thread. The set of
//! layers is closed and known at build time; the legality of moving a
//! thread between two layers is policy, supplied by configuration.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Number of topology layers. Registries indexed by layer are sized with
/// this constant.
pub const LAYER_COUNT: usize = 3;

/// The runtime region owning a thread.
#[repr(u32)]
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash, FromPrimitive, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Interpreter-lock host region.
    Python = 0,
    /// Green-thread host region.
    Go = 1,
    /// Event-loop host region.
    Node = 2,
}

impl Layer {
    pub const ALL: [Layer; LAYER_COUNT] = [Layer::Python, Layer::Go, Layer::Node];

    pub fn name(self) -> &'static str {
        match self {
            Layer::Python => "python",
            Layer::Go => "go",
            Layer::Node => "node",
        }
    }

    /// Index into layer-keyed tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Matrix of legal `(from, to)` layer transitions.
///
/// The default allows nothing; every edge must be opened explicitly, either
/// programmatically or from the `topology.transitions` configuration list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionMatrix {
    allowed: [[bool; LAYER_COUNT]; LAYER_COUNT],
}

impl TransitionMatrix {
    /// The deny-all matrix.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// A matrix with every edge open, including self transitions. Intended
    /// for tests and permissive deployments.
    pub fn allow_all() -> Self {
        TransitionMatrix {
            allowed: [[true; LAYER_COUNT]; LAYER_COUNT],
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Layer, Layer)>) -> Self {
        let mut m = Self::deny_all();
        for (from, to) in pairs {
            m.allow(from, to);
        }
        m
    }

    pub fn allow(&mut self, from: Layer, to: Layer) -> &mut Self {
        self.allowed[from.index()][to.index()] = true;
        self
    }

    pub fn deny(&mut self, from: Layer, to: Layer) -> &mut Self {
        self.allowed[from.index()][to.index()] = false;
        self
    }

    pub fn is_allowed(&self, from: Layer, to: Layer) -> bool {
        self.allowed[from.index()][to.index()]
    }
}

impl Serialize for TransitionMatrix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(Layer, Layer)> = Layer::ALL
            .iter()
            .flat_map(|from| Layer::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| self.is_allowed(*from, *to))
            .collect();
        pairs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransitionMatrix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(Layer, Layer)>::deserialize(deserializer)?;
        Ok(TransitionMatrix::from_pairs(pairs))
    }
}
