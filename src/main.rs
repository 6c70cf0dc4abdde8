pub mod back;
pub mod config;
pub mod mem;
pub mod probe;
pub mod report;
pub mod ten;

use crate::back::{host::HostBackend, wgpu::WgpuBackend, Backend, Error};
use crate::config::ProbeConfig;
use crate::report::Reporter;
use std::io::Write;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();

    let config = match ProbeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::debug!("{config:?}");

    let mut reporter = Reporter::new(std::io::stdout().lock());
    let res = if config.dry_run {
        run(Ok(HostBackend::new(config.memory_limit)), &config, &mut reporter)
    } else {
        let backend = pollster::block_on(WgpuBackend::new(&config));
        run(backend, &config, &mut reporter)
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Probe failed: {e:?}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Probe the selected device and report. An unavailable device is reported, not an error.
fn run<B: Backend, W: Write>(
    selected: Result<B, Error>,
    config: &ProbeConfig,
    reporter: &mut Reporter<W>,
) -> Result<(), Error> {
    let mut backend = match selected {
        Ok(b) => b,
        Err(e) if e.is_unavailable() => return reporter.unavailable(&e),
        Err(e) => return Err(e),
    };

    reporter.device(backend.info())?;
    let outcome = config.probe().run(&mut backend)?;
    reporter.outcome(&outcome)?;
    Ok(())
}
