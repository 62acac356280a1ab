//! Helpers around `candle_nn::VarMap` for models whose set of
//! parameters changes between training steps.

use candle_core::{bail, Result, Tensor, TensorId, Var};
use candle_nn::VarMap;
use std::collections::HashSet;

/// Overwrite (or create) the variable `name` with `value`
pub fn set_var(varmap: &VarMap, name: &str, value: &Tensor) -> Result<()> {
    let mut data = match varmap.data().lock() {
        Ok(data) => data,
        Err(_) => bail!("parameter store lock poisoned"),
    };
    match data.get(name) {
        Some(var) => var.set(value),
        None => {
            data.insert(name.to_string(), Var::from_tensor(value)?);
            Ok(())
        }
    }
}

/// Overwrite row `row` (along the first dimension) of the variable
/// `name` with `value_row`, keeping the other rows
pub fn set_var_row(varmap: &VarMap, name: &str, row: usize, value_row: &Tensor) -> Result<()> {
    let data = match varmap.data().lock() {
        Ok(data) => data,
        Err(_) => bail!("parameter store lock poisoned"),
    };
    let var = match data.get(name) {
        Some(var) => var,
        None => bail!("no variable named {}", name),
    };
    let current = var.as_tensor();
    let nrows = current.dim(0)?;
    if row >= nrows {
        bail!("row {} is out of range for {} ({} rows)", row, name, nrows);
    }

    let row_shape = current.narrow(0, row, 1)?.shape().clone();
    let value_row = value_row
        .reshape(row_shape)?
        .to_dtype(current.dtype())?
        .to_device(current.device())?;

    let mut parts = vec![];
    if row > 0 {
        parts.push(current.narrow(0, 0, row)?);
    }
    parts.push(value_row);
    if row + 1 < nrows {
        parts.push(current.narrow(0, row + 1, nrows - row - 1)?);
    }
    var.set(&Tensor::cat(&parts, 0)?)
}

/// Drop every variable whose name starts with `prefix`; returns the
/// number of evicted variables
pub fn evict_prefix(varmap: &VarMap, prefix: &str) -> Result<usize> {
    let mut data = match varmap.data().lock() {
        Ok(data) => data,
        Err(_) => bail!("parameter store lock poisoned"),
    };
    let before = data.len();
    data.retain(|name, _| !name.starts_with(prefix));
    Ok(before - data.len())
}

/// Tensor ids of all variables, to detect when the set of trainable
/// parameters has changed
pub fn var_ids(varmap: &VarMap) -> HashSet<TensorId> {
    varmap.all_vars().iter().map(|v| v.id()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_set_and_evict() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let a = vb.get_with_hints(3, "st.factor0.bias", Init::Const(0.))?;
        vb.get_with_hints(3, "st.factor1.bias", Init::Const(0.))?;

        set_var(&varmap, "st.factor0.bias", &Tensor::new(&[1f32, 2., 3.], &dev)?)?;
        // the tensor handed out earlier shares storage with the variable
        assert_eq!(a.to_vec1::<f32>()?, vec![1., 2., 3.]);

        assert_eq!(var_ids(&varmap).len(), 2);
        assert_eq!(evict_prefix(&varmap, "st.factor0.")?, 1);
        assert_eq!(var_ids(&varmap).len(), 1);

        let fresh = vb.get_with_hints(3, "st.factor0.bias", Init::Const(0.))?;
        assert_eq!(fresh.to_vec1::<f32>()?, vec![0., 0., 0.]);
        Ok(())
    }

    #[test]
    fn test_set_row() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let w = vb.get_with_hints((3, 2), "mixture.weight", Init::Const(1.))?;

        set_var_row(&varmap, "mixture.weight", 2, &Tensor::new(&[5f32, 6.], &dev)?)?;
        set_var_row(&varmap, "mixture.weight", 0, &Tensor::new(&[[7f32, 8.]], &dev)?)?;
        assert_eq!(
            w.to_vec2::<f32>()?,
            vec![vec![7., 8.], vec![1., 1.], vec![5., 6.]]
        );

        assert!(set_var_row(&varmap, "mixture.weight", 3, &Tensor::new(&[0f32, 0.], &dev)?).is_err());
        assert!(set_var_row(&varmap, "mixture.bias", 0, &Tensor::new(&[0f32], &dev)?).is_err());
        Ok(())
    }
}
