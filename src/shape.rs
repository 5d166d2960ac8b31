//! Broadcast shape inference and stride helpers for elementwise kernels.

use crate::error::{GpuError, GpuResult};

/// Maximum tensor rank accepted by the built-in kernels.
pub const MAX_RANK: usize = 8;

/// NumPy-style broadcast of two shapes, right-aligned: each dimension pair
/// must be equal or one of them 1.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> GpuResult<Vec<usize>> {
    if a.len() > MAX_RANK || b.len() > MAX_RANK {
        return Err(GpuError::InvalidInput(format!(
            "rank {} exceeds the supported maximum of {MAX_RANK}",
            a.len().max(b.len())
        )));
    }
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = dim_from_right(a, rank, i);
        let db = dim_from_right(b, rank, i);
        out[i] = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return Err(GpuError::InvalidInput(format!(
                "cannot broadcast shapes {a:?} and {b:?}: dimension {i} is {da} vs {db}"
            )));
        };
    }
    Ok(out)
}

fn dim_from_right(shape: &[usize], out_rank: usize, i: usize) -> usize {
    let offset = out_rank - shape.len();
    if i < offset {
        1
    } else {
        shape[i - offset]
    }
}

/// Row-major element strides of `shape` as read through the broadcast output
/// shape `out`: broadcast dimensions get stride 0.
pub fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let mut own = vec![0usize; shape.len()];
    let mut acc = 1usize;
    for (i, &dim) in shape.iter().enumerate().rev() {
        own[i] = acc;
        acc *= dim;
    }

    let offset = out.len() - shape.len();
    let mut strides = vec![0usize; out.len()];
    for i in 0..out.len() {
        if i < offset {
            continue;
        }
        let dim = shape[i - offset];
        strides[i] = if dim == 1 && out[i] != 1 { 0 } else { own[i - offset] };
    }
    strides
}

pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_equal_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[2, 3]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_broadcast_expands_ones() {
        assert_eq!(broadcast_shapes(&[2, 1, 4], &[1, 3, 1]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shapes(&[3, 4], &[4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[5], &[]).unwrap(), vec![5]);
    }

    #[test]
    fn test_broadcast_mismatch_fails() {
        let err = broadcast_shapes(&[2, 3], &[2, 4]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_broadcast_rank_limit() {
        let deep = vec![1usize; MAX_RANK + 1];
        let err = broadcast_shapes(&deep, &[1]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidInput(_)));
    }

    #[test]
    fn test_strides_zero_on_broadcast_dims() {
        // [3, 1] read through [3, 4]: rows advance by 1 element, cols repeat.
        assert_eq!(broadcast_strides(&[3, 1], &[3, 4]), vec![1, 0]);
        // [4] read through [3, 4]: leading dim is implicit-1, repeats.
        assert_eq!(broadcast_strides(&[4], &[3, 4]), vec![0, 1]);
        // Full shape: plain row-major strides.
        assert_eq!(broadcast_strides(&[2, 3, 4], &[2, 3, 4]), vec![12, 4, 1]);
    }

    #[test]
    fn test_scalar_strides() {
        assert_eq!(broadcast_strides(&[], &[2, 2]), vec![0, 0]);
        assert_eq!(element_count(&[]), 1);
    }
}
