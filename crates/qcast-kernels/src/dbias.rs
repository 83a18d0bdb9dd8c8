//! Bias-gradient reduction.
//!
//! Fused dbias kernels write one row of per-column partial sums per
//! [`CHUNK_ROWS`]-row chunk into an F32 workspace; [`reduce_dbias`] then sums
//! those rows in chunk order into the caller's `dbias` buffer.

use qcast_core::format;
use qcast_core::{DType, QcastError, Result};

use crate::CHUNK_ROWS;

/// Workspace shape `(⌈rows/128⌉, cols)` of F32 partial sums.
pub fn workspace_shape(rows: usize, cols: usize) -> (usize, usize) {
    (rows.div_ceil(CHUNK_ROWS), cols)
}

/// Sum `partial_rows` workspace rows into `dbias`, encoded as `dbias_dtype`.
pub fn reduce_dbias(
    workspace: &[u8],
    partial_rows: usize,
    cols: usize,
    dbias: &mut [u8],
    dbias_dtype: DType,
) -> Result<()> {
    let row_bytes = DType::F32.storage_bytes(cols);
    if workspace.len() < partial_rows * row_bytes {
        return Err(QcastError::MissingWorkspace {
            op: "reduce_dbias",
            required: partial_rows * cols,
            provided: workspace.len() / 4,
        });
    }
    if dbias.len() < dbias_dtype.storage_bytes(cols) {
        return Err(QcastError::invalid(
            "reduce_dbias",
            format!("dbias holds {} bytes, need {}", dbias.len(), dbias_dtype.storage_bytes(cols)),
        ));
    }

    let mut sums = vec![0.0f32; cols];
    for row in workspace[..partial_rows * row_bytes].chunks_exact(row_bytes) {
        for (acc, v) in sums.iter_mut().zip(format::decode_slice(DType::F32, row)) {
            *acc += v;
        }
    }
    let size = dbias_dtype.element_size();
    for (slot, &s) in dbias.chunks_exact_mut(size).zip(&sums) {
        format::encode_element(dbias_dtype, s, slot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_shape() {
        assert_eq!(workspace_shape(1, 5), (1, 5));
        assert_eq!(workspace_shape(128, 5), (1, 5));
        assert_eq!(workspace_shape(129, 5), (2, 5));
        assert_eq!(workspace_shape(0, 5), (0, 5));
    }

    #[test]
    fn test_reduce_rows_in_order() {
        let ws = format::encode_slice(DType::F32, &[1.0, 2.0, 10.0, 20.0, 100.0, 200.0]);
        let mut dbias = vec![0u8; 4];
        reduce_dbias(&ws, 3, 2, &mut dbias, DType::BF16).unwrap();
        assert_eq!(format::decode_slice(DType::BF16, &dbias), vec![111.0, 222.0]);
    }

    #[test]
    fn test_short_workspace() {
        let mut dbias = vec![0u8; 8];
        let err = reduce_dbias(&[0u8; 4], 1, 2, &mut dbias, DType::F32).unwrap_err();
        assert!(matches!(err, QcastError::MissingWorkspace { required: 2, .. }));
    }
}
