use ndarray::Ix2;

use crate::errors::{Operator, TensorError};
use crate::tensor::Tensor;

impl Tensor {
    /// 二维矩阵乘：`[m, k] @ [k, n] -> [m, n]`
    pub fn mat_mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let err = || TensorError::OperatorError {
            operator: Operator::MatMul,
            tensor1_shape: self.shape().to_vec(),
            tensor2_shape: other.shape().to_vec(),
        };
        let a = self
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| err())?;
        let b = other
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| err())?;
        if a.ncols() != b.nrows() {
            return Err(err());
        }
        Ok(Tensor {
            data: a.dot(&b).into_dyn(),
        })
    }
}
