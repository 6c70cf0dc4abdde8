use crate::back::{Backend, BufferT, DeviceInfo, DeviceKind, Error, ErrorKind};
use crate::mem::{Block, MemorySnapshot, MemoryPool, RawBlock};
use crate::ten::Shape;
use ndarray::{ArcArray, IxDyn};
use std::cell::RefCell;
use std::mem::size_of;

impl RawBlock for Vec<f32> {
    fn release(self) {}
}

/// Backend keeping its "device" memory in host vectors, accounted through the same pool.
#[derive(Debug)]
pub struct HostBackend {
    pub info: DeviceInfo,
    pool: MemoryPool<Vec<f32>>,
    scopes: usize,
}

impl HostBackend {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            info: DeviceInfo {
                index: 0,
                name: "host".to_string(),
                kind: DeviceKind::Host,
                api: "Host".to_string(),
            },
            pool: MemoryPool::new(limit),
            scopes: 0,
        }
    }

    #[cfg(test)]
    pub fn scopes(&self) -> usize {
        self.scopes
    }
}

impl BufferT<HostBackend> for RefCell<Block<Vec<f32>>> {
    fn upload(&self, _: &mut HostBackend, n: ArcArray<f32, IxDyn>) -> Result<(), Error> {
        let data = n.as_standard_layout();
        let mut block = self.borrow_mut();
        if data.len() > block.len() {
            return Err(ErrorKind::WrongShape {
                expected: Shape::from(vec![block.len()]),
                got: Shape::from(data.shape()),
            }
            .into());
        }
        for (dst, src) in block.iter_mut().zip(data.iter()) {
            *dst = *src;
        }
        Ok(())
    }

    fn download(&self, shape: &Shape, _: &mut HostBackend) -> Result<ArcArray<f32, IxDyn>, Error> {
        let block = self.borrow();
        let n = shape.prod().unwrap_or(usize::MAX);
        if n > block.len() {
            return Err(ErrorKind::WrongShape {
                expected: Shape::from(vec![block.len()]),
                got: shape.clone(),
            }
            .into());
        }
        ArcArray::from_shape_vec(IxDyn(&shape[..]), block[..n].to_vec()).map_err(|_| {
            ErrorKind::WrongShape {
                expected: shape.clone(),
                got: Shape::from(vec![n]),
            }
            .into()
        })
    }
}

impl Backend for HostBackend {
    type Buffer = RefCell<Block<Vec<f32>>>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer, Error> {
        let block = self.pool.alloc(shape.bytes()?, |size| {
            let len = usize::try_from(size)
                .map(|s| s / size_of::<f32>())
                .map_err(|_| ErrorKind::DeviceOutOfMemory { requested: size })?;
            let mut v = Vec::new();
            v.try_reserve_exact(len)
                .map_err(|_| ErrorKind::DeviceOutOfMemory { requested: size })?;
            v.resize(len, 0.0);
            Ok(v)
        })?;
        Ok(RefCell::new(block))
    }

    fn memory_usage(&self) -> MemorySnapshot {
        self.pool.snapshot()
    }

    fn peak_allocated(&self) -> u64 {
        self.pool.peak_allocated()
    }

    fn synchronize(&mut self) {}

    fn empty_cache(&mut self) -> u64 {
        self.pool.empty_cache()
    }

    fn enter_scope(&mut self) {
        self.scopes += 1;
    }

    fn exit_scope(&mut self) -> Result<(), Error> {
        match self.scopes.checked_sub(1) {
            Some(s) => {
                self.scopes = s;
                Ok(())
            }
            None => Err(ErrorKind::Device("exit without a matching enter".to_string()).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shape;

    #[test]
    fn test_upload_download() {
        let mut b = HostBackend::new(None);
        let sh = shape![2, 3];
        let buf = b.buffer(&sh).unwrap();

        let data = ArcArray::from_shape_vec(IxDyn(&[2, 3]), vec![1., 2., 3., 4., 5., 6.]).unwrap();
        buf.upload(&mut b, data.clone()).unwrap();
        assert_eq!(buf.download(&sh, &mut b).unwrap(), data);
    }

    #[test]
    fn test_buffer_accounting() {
        let mut b = HostBackend::new(None);
        let buf = b.buffer(&shape![1000]).unwrap();
        assert_eq!(b.memory_usage().allocated, 4096);
        drop(buf);
        assert_eq!(b.memory_usage().allocated, 0);
        assert_eq!(b.memory_usage().reserved, 4096);
        assert_eq!(b.empty_cache(), 4096);
        assert_eq!(b.memory_usage().reserved, 0);
    }

    #[test]
    fn test_over_limit_fails() {
        let mut b = HostBackend::new(Some(1024));
        let err = b.buffer(&shape![1024]).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(b.memory_usage(), MemorySnapshot::default());
    }

    #[test]
    fn test_overflowing_shape_fails() {
        let mut b = HostBackend::new(None);
        let err = b.buffer(&shape![(1usize << 62) - 1]).unwrap_err();
        assert!(err.is_out_of_memory());

        let err = b.buffer(&shape![1usize << 62, 4]).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(b.memory_usage(), MemorySnapshot::default());
    }

    #[test]
    fn test_unbalanced_exit_scope() {
        let mut b = HostBackend::new(None);
        b.enter_scope();
        assert!(b.exit_scope().is_ok());
        assert!(b.exit_scope().is_err());
    }
}
