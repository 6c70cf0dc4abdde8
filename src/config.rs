use crate::back::{Error, ErrorKind};
use crate::probe::Probe;
use crate::shape;
use crate::ten::Shape;
use std::str::FromStr;

pub const ENV_DEVICE: &str = "GPUPROBE_DEVICE";
pub const ENV_DIMS: &str = "GPUPROBE_DIMS";
pub const ENV_SEED: &str = "GPUPROBE_SEED";
pub const ENV_MEMORY_LIMIT: &str = "GPUPROBE_MEMORY_LIMIT";
pub const ENV_VERIFY: &str = "GPUPROBE_VERIFY";
pub const ENV_EMPTY_CACHE: &str = "GPUPROBE_EMPTY_CACHE";
pub const ENV_ALLOW_SOFTWARE: &str = "GPUPROBE_ALLOW_SOFTWARE";
pub const ENV_DRY_RUN: &str = "GPUPROBE_DRY_RUN";

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Adapter index, in enumeration order.
    pub device_index: usize,
    pub shape: Shape,
    pub seed: Option<u64>,
    /// Cap on reserved bytes. Unlimited when unset.
    pub memory_limit: Option<u64>,
    /// Read the allocation back and compare before measuring.
    pub verify: bool,
    /// Return cached blocks to the device before the second snapshot.
    pub empty_cache: bool,
    /// Accept software adapters as the device.
    pub allow_software: bool,
    /// Probe host memory instead of opening a device.
    pub dry_run: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            shape: shape![10000, 10000],
            seed: None,
            memory_limit: None,
            verify: false,
            empty_cache: false,
            allow_software: false,
            dry_run: false,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `GPUPROBE_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_DEVICE) {
            cfg.device_index = parse(ENV_DEVICE, &v)?;
        }
        if let Some(v) = get(ENV_DIMS) {
            cfg.shape = parse(ENV_DIMS, &v)?;
        }
        if let Some(v) = get(ENV_SEED) {
            cfg.seed = Some(parse(ENV_SEED, &v)?);
        }
        if let Some(v) = get(ENV_MEMORY_LIMIT) {
            cfg.memory_limit = Some(parse(ENV_MEMORY_LIMIT, &v)?);
        }
        if let Some(v) = get(ENV_VERIFY) {
            cfg.verify = flag(ENV_VERIFY, &v)?;
        }
        if let Some(v) = get(ENV_EMPTY_CACHE) {
            cfg.empty_cache = flag(ENV_EMPTY_CACHE, &v)?;
        }
        if let Some(v) = get(ENV_ALLOW_SOFTWARE) {
            cfg.allow_software = flag(ENV_ALLOW_SOFTWARE, &v)?;
        }
        if let Some(v) = get(ENV_DRY_RUN) {
            cfg.dry_run = flag(ENV_DRY_RUN, &v)?;
        }
        Ok(cfg)
    }

    pub fn probe(&self) -> Probe {
        Probe {
            shape: self.shape.clone(),
            seed: self.seed,
            verify: self.verify,
            empty_cache: self.empty_cache,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse::<T>().map_err(|e| {
        ErrorKind::Config {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ErrorKind::Config {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }
        .into()),
    }
}
