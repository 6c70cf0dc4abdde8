use crate::back::{DeviceInfo, DeviceKind, Error, ErrorKind};
use crate::mem::mib;
use crate::probe::ProbeOutcome;
use std::io::Write;

pub const UNAVAILABLE: &str = "GPU support is not available.";

/// Human-readable console output of a probe run.
pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn unavailable(&mut self, reason: &ErrorKind) -> Result<(), Error> {
        log::info!("{reason}");
        writeln!(self.out, "{UNAVAILABLE}").map_err(ErrorKind::from)?;
        Ok(())
    }

    pub fn device(&mut self, info: &DeviceInfo) -> Result<(), Error> {
        let res = match info.kind {
            DeviceKind::Host => writeln!(self.out, "Dry run, no GPU used: {info}"),
            _ => writeln!(self.out, "GPU available: {info}"),
        };
        res.map_err(ErrorKind::from)?;
        Ok(())
    }

    pub fn outcome(&mut self, o: &ProbeOutcome) -> Result<(), Error> {
        self.write_outcome(o).map_err(ErrorKind::from)?;
        if o.retained() {
            log::info!(
                "Allocator kept {:.2} MiB reserved after release",
                mib(o.after.reserved.saturating_sub(o.after.allocated))
            );
        }
        Ok(())
    }

    fn write_outcome(&mut self, o: &ProbeOutcome) -> std::io::Result<()> {
        writeln!(
            self.out,
            "Allocated {} f32 ({} bytes)",
            o.shape, o.requested
        )?;
        writeln!(self.out, "GPU Memory Usage Before Release:")?;
        writeln!(self.out, "{}", o.before)?;
        writeln!(self.out, "GPU Memory Usage After Release:")?;
        writeln!(self.out, "{}", o.after)?;
        writeln!(self.out, "Difference (allocated): {} bytes", o.diff())?;
        self.out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::MemorySnapshot;
    use crate::shape;

    #[test]
    fn test_outcome_output() {
        let mut r = Reporter::new(Vec::new());
        r.device(&DeviceInfo {
            index: 0,
            name: "Test GPU".to_string(),
            kind: DeviceKind::Discrete,
            api: "Vulkan".to_string(),
        })
        .unwrap();
        r.outcome(&ProbeOutcome {
            shape: shape![16, 16],
            requested: 1024,
            before: MemorySnapshot {
                allocated: 1024,
                reserved: 1024,
            },
            after: MemorySnapshot {
                allocated: 0,
                reserved: 1024,
            },
        })
        .unwrap();

        let text = String::from_utf8(r.into_inner()).unwrap();
        assert_eq!(
            text,
            "GPU available: Test GPU (Vulkan, discrete)\n\
             Allocated 16x16 f32 (1024 bytes)\n\
             GPU Memory Usage Before Release:\n\
             \x20 allocated: 1024 bytes (0.00 MiB)\n\
             \x20 reserved:  1024 bytes (0.00 MiB)\n\
             GPU Memory Usage After Release:\n\
             \x20 allocated: 0 bytes (0.00 MiB)\n\
             \x20 reserved:  1024 bytes (0.00 MiB)\n\
             Difference (allocated): -1024 bytes\n"
        );
    }

    #[test]
    fn test_host_run_does_not_claim_a_gpu() {
        let mut r = Reporter::new(Vec::new());
        r.device(&DeviceInfo {
            index: 0,
            name: "host".to_string(),
            kind: DeviceKind::Host,
            api: "Host".to_string(),
        })
        .unwrap();
        let text = String::from_utf8(r.into_inner()).unwrap();
        assert_eq!(text, "Dry run, no GPU used: host (Host, host)\n");
        assert!(!text.contains("GPU available"));
    }

    #[test]
    fn test_unavailable_output() {
        let mut r = Reporter::new(Vec::new());
        r.unavailable(&ErrorKind::Unavailable {
            reason: "no adapters".to_string(),
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(r.into_inner()).unwrap(),
            "GPU support is not available.\n"
        );
    }
}
