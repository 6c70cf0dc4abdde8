use crate::back::{select_device, Backend, BufferT, DeviceInfo, DeviceKind, Error, ErrorKind};
use crate::config::ProbeConfig;
use crate::mem::{Block, MemorySnapshot, MemoryPool, RawBlock};
use crate::ten::Shape;
use defer::defer;
use ndarray::{ArcArray, IxDyn};
use wgpu::{
    Adapter, AdapterInfo, Backends, BufferDescriptor, BufferUsages, Device, DeviceDescriptor,
    DeviceType, ErrorFilter, Features, Instance, Maintain, MapMode, Queue,
};

impl RawBlock for wgpu::Buffer {
    fn release(self) {
        self.destroy();
    }
}

impl DeviceInfo {
    fn from_adapter(index: usize, info: &AdapterInfo) -> Self {
        Self {
            index,
            name: info.name.clone(),
            kind: match info.device_type {
                DeviceType::DiscreteGpu => DeviceKind::Discrete,
                DeviceType::IntegratedGpu => DeviceKind::Integrated,
                DeviceType::VirtualGpu => DeviceKind::Virtual,
                DeviceType::Cpu => DeviceKind::Cpu,
                DeviceType::Other => DeviceKind::Other,
            },
            api: format!("{:?}", info.backend),
        }
    }
}

fn map_device_error(e: wgpu::Error, requested: u64) -> Error {
    match e {
        wgpu::Error::OutOfMemory { .. } => ErrorKind::DeviceOutOfMemory { requested }.into(),
        wgpu::Error::Validation { description, .. } => ErrorKind::Device(description).into(),
        #[allow(unreachable_patterns)]
        other => ErrorKind::Device(other.to_string()).into(),
    }
}

impl BufferT<WgpuBackend> for Block<wgpu::Buffer> {
    fn upload(&self, e: &mut WgpuBackend, n: ArcArray<f32, IxDyn>) -> Result<(), Error> {
        let data = n.as_standard_layout();
        let data = data
            .as_slice()
            .ok_or_else(|| ErrorKind::Device("host data is not contiguous".to_string()))?;
        let bytes: &[u8] = bytemuck::cast_slice(data);

        if bytes.len() as u64 > self.size() {
            return Err(ErrorKind::WrongShape {
                expected: Shape::from(vec![self.size() as usize / 4]),
                got: Shape::from(n.shape()),
            }
            .into());
        }

        e.queue.write_buffer(self, 0, bytes);
        e.queue.submit(None);
        Ok(())
    }

    fn download(&self, shape: &Shape, e: &mut WgpuBackend) -> Result<ArcArray<f32, IxDyn>, Error> {
        let size = shape.bytes()?;
        if size > self.size() {
            return Err(ErrorKind::WrongShape {
                expected: Shape::from(vec![self.size() as usize / 4]),
                got: shape.clone(),
            }
            .into());
        }

        // Staging memory is transient and stays outside the pool
        let recv_buffer = e.device.create_buffer(&BufferDescriptor {
            label: Some("readback"),
            size,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = e.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(self, 0, &recv_buffer, 0, size);
        e.queue.submit(Some(encoder.finish()));

        let bufslice = recv_buffer.slice(..);
        log::debug!("Mapping {} bytes as {}", size, shape);
        let (s, r) = futures_intrusive::channel::shared::oneshot_channel();
        bufslice.map_async(MapMode::Read, move |v| {
            let _ = s.send(v);
        });
        e.device.poll(Maintain::Wait);

        match pollster::block_on(r.receive()) {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(ErrorKind::from(err).into()),
            None => return Err(ErrorKind::Device("readback was cancelled".to_string()).into()),
        }

        let _unmap = defer(|| recv_buffer.unmap());
        let data = bufslice.get_mapped_range();
        let res: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);

        ArcArray::from_shape_vec(IxDyn(&shape[..]), res).map_err(|_| {
            ErrorKind::WrongShape {
                expected: shape.clone(),
                got: Shape::from(vec![size as usize / 4]),
            }
            .into()
        })
    }
}

pub struct WgpuBackend {
    pub info: DeviceInfo,
    pub inst: Instance,
    pub adapter: Adapter,
    pub device: Device,
    pub queue: Queue,
    pool: MemoryPool<wgpu::Buffer>,
    scopes: usize,
}

impl WgpuBackend {
    /// Enumerate adapters and open the one `config` selects.
    ///
    /// Fails with [`ErrorKind::Unavailable`] when there is no usable accelerator.
    pub async fn new(config: &ProbeConfig) -> Result<Self, Error> {
        let inst = Instance::default();

        let mut adapters = inst.enumerate_adapters(Backends::all()).collect::<Vec<_>>();
        let infos = adapters
            .iter()
            .enumerate()
            .map(|(i, a)| DeviceInfo::from_adapter(i, &a.get_info()))
            .collect::<Vec<_>>();
        for d in &infos {
            log::debug!("Found adapter {}: {}", d.index, d);
        }

        let info = select_device(&infos, config.device_index, config.allow_software)?.clone();
        let adapter = adapters.swap_remove(info.index);
        log::info!("Selected adapter {}: {}", info.index, info);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("gpuprobe"),
                    features: Features::empty(),
                    limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(ErrorKind::from)?;

        Ok(Self {
            info,
            inst,
            adapter,
            device,
            queue,
            pool: MemoryPool::new(config.memory_limit),
            scopes: 0,
        })
    }
}

impl Backend for WgpuBackend {
    type Buffer = Block<wgpu::Buffer>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer, Error> {
        let max = self.device.limits().max_buffer_size;
        let device = &self.device;

        self.pool.alloc(shape.bytes()?, |size| {
            if size > max {
                return Err(ErrorKind::BufferTooLarge {
                    requested: size,
                    max,
                }
                .into());
            }

            device.push_error_scope(ErrorFilter::OutOfMemory);
            let buf = device.create_buffer(&BufferDescriptor {
                label: Some("probe block"),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });

            match pollster::block_on(device.pop_error_scope()) {
                None => Ok(buf),
                Some(e) => {
                    buf.destroy();
                    Err(map_device_error(e, size))
                }
            }
        })
    }

    fn memory_usage(&self) -> MemorySnapshot {
        self.pool.snapshot()
    }

    fn peak_allocated(&self) -> u64 {
        self.pool.peak_allocated()
    }

    fn synchronize(&mut self) {
        self.device.poll(Maintain::Wait);
    }

    fn empty_cache(&mut self) -> u64 {
        let freed = self.pool.empty_cache();
        self.device.poll(Maintain::Wait);
        freed
    }

    fn enter_scope(&mut self) {
        self.device.push_error_scope(ErrorFilter::Validation);
        self.scopes += 1;
    }

    fn exit_scope(&mut self) -> Result<(), Error> {
        if self.scopes == 0 {
            return Err(ErrorKind::Device("exit without a matching enter".to_string()).into());
        }
        self.scopes -= 1;
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(()),
            Some(e) => Err(map_device_error(e, 0)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::Probe;
    use crate::shape;

    fn open() -> Option<WgpuBackend> {
        match pollster::block_on(WgpuBackend::new(&ProbeConfig::default())) {
            Ok(b) => Some(b),
            Err(e) if e.is_unavailable() => {
                println!("Skipping, no accelerator: {e}");
                None
            }
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    fn test_upload_download_roundtrip() {
        let Some(mut b) = open() else { return };
        let sh = shape![4, 8];
        let data = ArcArray::from_shape_vec(IxDyn(&[4, 8]), (0..32).map(|v| v as f32).collect())
            .unwrap();

        let buf = b.buffer(&sh).unwrap();
        buf.upload(&mut b, data.clone()).unwrap();
        assert_eq!(buf.download(&sh, &mut b).unwrap(), data);
    }

    #[test]
    fn test_probe_on_device() {
        let Some(mut b) = open() else { return };
        let probe = Probe {
            shape: shape![512, 512],
            seed: Some(7),
            verify: true,
            empty_cache: false,
        };

        let out = probe.run(&mut b).unwrap();
        assert!(out.before.allocated >= out.requested);
        assert!(out.after.allocated <= out.before.allocated);
        assert_eq!(out.after.reserved, out.before.reserved);
    }

    #[test]
    fn test_oversized_buffer_fails() {
        let Some(mut b) = open() else { return };
        let max = b.device.limits().max_buffer_size;
        let elems = usize::try_from(max / 4 + (1 << 20)).unwrap_or(usize::MAX);
        let err = b.buffer(&shape![elems]).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(b.memory_usage().allocated, 0);
    }
}
