use crate::back::{Error, ErrorKind};
use ndarray::{IxDyn, ShapeBuilder};
use std::fmt::{Display, Formatter};
use std::mem::size_of;
use std::ops::{Index, RangeFull};
use std::str::FromStr;

#[macro_export]
macro_rules! shape {
    ($($s:expr),* $(,)?) => {
        $crate::ten::shape::Shape::from(vec![ $($s),*])
    };
}

#[derive(Default, Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Element count, `None` when it does not fit in `usize`.
    pub fn prod(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }

    /// Size of a dense `f32` block with this shape.
    pub fn bytes(&self) -> Result<u64, Error> {
        self.prod()
            .and_then(|n| n.checked_mul(size_of::<f32>()))
            .and_then(|b| u64::try_from(b).ok())
            .ok_or_else(|| ErrorKind::SizeOverflow { shape: self.clone() }.into())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Self { dims: value }
    }
}

impl From<&Shape> for Shape {
    fn from(value: &Shape) -> Self {
        value.clone()
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Self {
            dims: value.to_vec(),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Self {
            dims: value.to_vec(),
        }
    }
}

impl From<&Shape> for ndarray::Shape<IxDyn> {
    fn from(value: &Shape) -> Self {
        value.dims.as_slice().into_shape()
    }
}

impl Index<RangeFull> for Shape {
    type Output = [usize];

    fn index(&self, _: RangeFull) -> &Self::Output {
        &self.dims[..]
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Parses `10000x10000` style dimension lists. Zero-sized dims are rejected.
impl FromStr for Shape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dims = s
            .split(|c| c == 'x' || c == 'X' || c == ',')
            .map(|d| d.trim())
            .map(|d| match d.parse::<usize>() {
                Ok(0) => Err(format!("zero-sized dimension in {s:?}")),
                Ok(v) => Ok(v),
                Err(e) => Err(format!("bad dimension {d:?}: {e}")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if dims.is_empty() {
            return Err("empty shape".to_string());
        }
        Ok(Shape { dims })
    }
}
