//! Restores every frozen row of the token table after an optimizer step

use candle_core::{DType, Tensor, Var};
use std::ops::Range;

use super::error::{InversionError, Result};

/// Immutable copy of the token table taken right after the resize, plus the
/// row mask of the trainable block
pub struct EmbeddingGuard {
    snapshot: Tensor,
    trainable: Range<usize>,
    /// `[vocab, 1]` u8, 1 on trainable rows
    keep_live: Tensor,
}

impl EmbeddingGuard {
    pub fn capture(table: &Var, trainable: Range<usize>) -> Result<Self> {
        let snapshot = table.as_detached_tensor().copy()?;
        let (vocab_size, _) = snapshot.dims2()?;
        if trainable.start >= trainable.end || trainable.end > vocab_size {
            return Err(InversionError::ShapeMismatch {
                context: format!("trainable rows {:?}", trainable),
                expected: vec![trainable.end],
                found: vec![vocab_size],
            });
        }

        let mask: Vec<u8> = (0..vocab_size)
            .map(|row| u8::from(trainable.contains(&row)))
            .collect();
        let keep_live = Tensor::from_vec(mask, (vocab_size, 1), snapshot.device())?;

        Ok(Self {
            snapshot,
            trainable,
            keep_live,
        })
    }

    /// Overwrite all rows outside the trainable block with the snapshot.
    /// Works on detached values so nothing is recorded for backprop.
    pub fn restore(&self, table: &Var) -> Result<()> {
        let live = table.as_detached_tensor();
        self.check_shape(&live)?;

        let mask = self.keep_live.broadcast_as(live.shape())?;
        let snapshot = self.snapshot.to_dtype(live.dtype())?;
        let restored = mask.where_cond(&live, &snapshot)?;
        table.set(&restored)?;
        Ok(())
    }

    /// Largest absolute difference between frozen live rows and the snapshot
    pub fn frozen_drift(&self, table: &Var) -> Result<f32> {
        let live = table.as_detached_tensor();
        self.check_shape(&live)?;

        let frozen = self
            .keep_live
            .broadcast_as(live.shape())?
            .where_cond(&live.zeros_like()?, &(live - &self.snapshot)?.abs()?)?;
        Ok(frozen.to_dtype(DType::F32)?.max_all()?.to_scalar::<f32>()?)
    }

    pub fn trainable_rows(&self) -> Range<usize> {
        self.trainable.clone()
    }

    pub fn snapshot(&self) -> &Tensor {
        &self.snapshot
    }

    fn check_shape(&self, live: &Tensor) -> Result<()> {
        if live.dims() != self.snapshot.dims() {
            return Err(InversionError::SnapshotShapeMismatch {
                snapshot: self.snapshot.dims().to_vec(),
                live: live.dims().to_vec(),
            });
        }
        Ok(())
    }
}
