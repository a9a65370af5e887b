//! Distance-function catalog.
//!
//! Metrics are stored by name in each index's metadata file and resolved
//! back through [`Distance::from_str`] when the catalog is reloaded.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    L2,
    Dot,
    Cosine,
}

impl Distance {
    /// Score two equidimensional vectors; lower is closer.
    ///
    /// Dot product and cosine similarity are negated/inverted so that all
    /// three metrics order candidates the same way.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Distance::L2 => l2_distance(a, b),
            Distance::Dot => -dot_product(a, b),
            Distance::Cosine => cosine_distance(a, b),
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distance::L2 => "L2",
            Distance::Dot => "DOT",
            Distance::Cosine => "COSINE",
        };
        f.write_str(name)
    }
}

impl FromStr for Distance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L2" => Ok(Distance::L2),
            "DOT" => Ok(Distance::Dot),
            "COSINE" => Ok(Distance::Cosine),
            other => bail!("unknown distance function `{other}`"),
        }
    }
}

#[inline]
fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}
