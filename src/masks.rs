//! Causal attention masks for full-sequence scoring
//!
//! Every scoring pass runs the whole text at once, so the only mask needed
//! is the lower-triangular causal mask. One mask is kept per
//! `(device kind, dtype)`, sized to the longest sequence seen so far;
//! shorter sequences get its top-left corner.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = (usize, DType);

static CAUSAL_MASKS: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Assumes one device per kind.
fn device_kind(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn build_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let values: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(values, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Causal mask for a sequence of `seq_len` tokens
///
/// The cached mask only grows: a request longer than anything seen so far
/// replaces it, anything shorter is a `narrow` view into it. Memory is
/// bounded by the longest text scored, not by the number of distinct lengths.
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
///
/// # Example
///
/// For seq_len=3 the mask is:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (device_kind(device), dtype);
    let mut cache = CAUSAL_MASKS
        .lock()
        .map_err(|_| anyhow!("causal mask cache poisoned"))?;

    if let Some(mask) = cache.get(&key) {
        if mask.dim(3)? >= seq_len {
            return Ok(mask.narrow(2, 0, seq_len)?.narrow(3, 0, seq_len)?);
        }
    }

    let mask = build_mask(seq_len, device, dtype)?;
    cache.insert(key, mask.clone());
    Ok(mask)
}

/// Drop all cached masks
#[cfg(test)]
pub(crate) fn clear_mask_cache() {
    if let Ok(mut cache) = CAUSAL_MASKS.lock() {
        cache.clear();
    }
}

/// Number of cached masks
#[cfg(test)]
pub(crate) fn mask_cache_len() -> usize {
    CAUSAL_MASKS.lock().map(|cache| cache.len()).unwrap_or(0)
}

/// Side length of the cached mask for `(device, dtype)`
#[cfg(test)]
pub(crate) fn cached_mask_size(device: &Device, dtype: DType) -> Option<usize> {
    let cache = CAUSAL_MASKS.lock().ok()?;
    cache
        .get(&(device_kind(device), dtype))
        .and_then(|mask| mask.dim(3).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v = data[i * 3 + j];
                if j <= i {
                    assert_eq!(v, 0.0);
                } else {
                    assert!(v.is_infinite() && v < 0.0);
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_causal_mask_cache_keeps_one_mask() {
        clear_mask_cache();
        assert_eq!(mask_cache_len(), 0);

        causal_mask(5, &Device::Cpu, DType::F32).unwrap();
        causal_mask(5, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_len(), 1);

        causal_mask(9, &Device::Cpu, DType::F32).unwrap();
        causal_mask(2, &Device::Cpu, DType::F32).unwrap();
        causal_mask(7, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_len(), 1);
        assert_eq!(cached_mask_size(&Device::Cpu, DType::F32), Some(9));
    }

    #[test]
    #[serial]
    fn test_narrowed_mask_matches_fresh_mask() {
        clear_mask_cache();
        causal_mask(8, &Device::Cpu, DType::F32).unwrap();

        let narrowed = causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(narrowed.dims(), &[1, 1, 4, 4]);
        let fresh = build_mask(4, &Device::Cpu, DType::F32).unwrap();

        let a: Vec<f32> = narrowed.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = fresh.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
