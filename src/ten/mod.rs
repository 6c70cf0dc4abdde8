pub mod shape;

pub use shape::*;

use crate::back::{Backend, BufferT, Error, ErrorKind};
use ndarray::{ArcArray, ArrayBase, IxDyn, OwnedArcRepr};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use std::fmt::{Debug, Formatter};

/// Host-side standard-normal values of `shape`.
pub fn randn<R: Rng + ?Sized>(shape: &Shape, rng: &mut R) -> ArcArray<f32, IxDyn> {
    let sh: ndarray::Shape<IxDyn> = shape.into();
    ArrayBase::<OwnedArcRepr<f32>, IxDyn>::random_using(sh, StandardNormal, rng)
}

/// Dense `f32` tensor resident on a backend's device.
///
/// The tensor is the only owner of its buffer; dropping it hands the memory back
/// to the backend's pool.
pub struct Tensor<B: Backend> {
    shape: Shape,
    buf: B::Buffer,
}

impl<B: Backend> Tensor<B> {
    /// Allocate device memory for `shape` without initializing it.
    pub fn empty(b: &mut B, shape: &Shape) -> Result<Self, Error> {
        let buf = b.buffer(shape)?;
        Ok(Self {
            shape: shape.clone(),
            buf,
        })
    }

    /// Allocate device memory for `data` and upload it.
    pub fn from_host(b: &mut B, data: ArcArray<f32, IxDyn>) -> Result<Self, Error> {
        let t = Self::empty(b, &Shape::from(data.shape()))?;
        t.upload(b, data)?;
        Ok(t)
    }

    pub fn upload(&self, b: &mut B, data: ArcArray<f32, IxDyn>) -> Result<(), Error> {
        if data.shape() != &self.shape[..] {
            return Err(ErrorKind::WrongShape {
                expected: self.shape.clone(),
                got: Shape::from(data.shape()),
            }
            .into());
        }
        self.buf.upload(b, data)
    }

    pub fn bytes(&self) -> u64 {
        // Checked when the buffer was allocated
        self.shape.bytes().unwrap_or_default()
    }

    pub fn download(&self, b: &mut B) -> Result<ArcArray<f32, IxDyn>, Error> {
        self.buf.download(&self.shape, b)
    }

    /// Read the tensor back and compare it element by element with `expected`.
    pub fn verify(&self, b: &mut B, expected: &ArcArray<f32, IxDyn>) -> Result<(), Error> {
        let got = self.download(b)?;
        if got.shape() != expected.shape() {
            return Err(ErrorKind::WrongShape {
                expected: Shape::from(expected.shape()),
                got: Shape::from(got.shape()),
            }
            .into());
        }

        match got
            .iter()
            .zip(expected.iter())
            .position(|(g, e)| g.to_bits() != e.to_bits())
        {
            None => Ok(()),
            Some(index) => Err(ErrorKind::Mismatch {
                index,
                expected: expected.iter().nth(index).copied().unwrap_or_default(),
                got: got.iter().nth(index).copied().unwrap_or_default(),
            }
            .into()),
        }
    }
}

impl<B: Backend> Debug for Tensor<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor").field("shape", &self.shape).finish()
    }
}
