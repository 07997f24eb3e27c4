use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// One of the five fixed dimensions of an image stack, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    #[serde(rename = "r")]
    Round,
    #[serde(rename = "c")]
    Ch,
    #[serde(rename = "z")]
    ZPlane,
    #[serde(rename = "y")]
    Y,
    #[serde(rename = "x")]
    X,
}

pub const N_AXES: usize = 5;

impl Axis {
    pub const ALL: [Axis; N_AXES] = [Axis::Round, Axis::Ch, Axis::ZPlane, Axis::Y, Axis::X];
    pub const CATEGORICAL: [Axis; 3] = [Axis::Round, Axis::Ch, Axis::ZPlane];

    /// Position of this axis in the buffer.
    pub fn order(self) -> usize {
        match self {
            Axis::Round => 0,
            Axis::Ch => 1,
            Axis::ZPlane => 2,
            Axis::Y => 3,
            Axis::X => 4,
        }
    }

    pub fn is_categorical(self) -> bool {
        self.order() < 3
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::Round => "r",
            Axis::Ch => "c",
            Axis::ZPlane => "z",
            Axis::Y => "y",
            Axis::X => "x",
        }
    }
}

impl Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sorts and deduplicates a caller-provided axis list into canonical order.
pub fn canonical(axes: &[Axis]) -> Vec<Axis> {
    let mut out = axes.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Identifies one 2D tile by its categorical labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub round: usize,
    pub ch: usize,
    pub zplane: usize,
}

impl TileKey {
    pub fn new(round: usize, ch: usize, zplane: usize) -> Self {
        Self { round, ch, zplane }
    }

    pub fn label(&self, axis: Axis) -> Option<usize> {
        match axis {
            Axis::Round => Some(self.round),
            Axis::Ch => Some(self.ch),
            Axis::ZPlane => Some(self.zplane),
            Axis::Y | Axis::X => None,
        }
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(r: {}, c: {}, z: {})", self.round, self.ch, self.zplane)
    }
}

/// Physical stage axis of a coordinate bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalAxis {
    X,
    Y,
    Z,
}
