//! Sparse aggregation between pixel grids and labelled spots.
//!
//! A label map assigns each pixel to exactly one label, `0` being
//! background. Pooling (gather) sums pixel rows into per-label rows;
//! broadcasting (scatter) copies per-label rows back onto the pixels.
//! Both are sparse one-hot products realized with `index_add` and
//! `index_select`, so no dense (pixels x labels) matrix is built.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Sum the rows of `x_pk` that share a label.
///
/// # Arguments
/// * `label_p` - flattened label map (p,), integer labels in `0..num_labels`
/// * `x_pk` - per-pixel values (p x k)
/// * `num_labels` - number of labels including background `0`
///
/// # Returns
/// `(num_labels - 1) x k`: row `i` holds the sum over pixels with label
/// `i + 1`; background pixels are dropped
pub fn pool_by_label(label_p: &Tensor, x_pk: &Tensor, num_labels: usize) -> Result<Tensor> {
    let (np, kk) = x_pk.dims2()?;
    let label_p = label_p.flatten_all()?.to_dtype(DType::U32)?;
    if label_p.dim(0)? != np {
        bail!(
            "label map has {} pixels but the pixel matrix has {} rows",
            label_p.dim(0)?,
            np
        );
    }
    check_label_range(&label_p, num_labels)?;
    if num_labels < 2 {
        bail!("need at least one non-background label");
    }
    let pooled_lk = Tensor::zeros((num_labels, kk), x_pk.dtype(), x_pk.device())?.index_add(
        &label_p,
        &x_pk.contiguous()?,
        0,
    )?;
    pooled_lk.narrow(0, 1, num_labels - 1)
}

/// Copy per-label rows back onto the pixels carrying that label.
///
/// # Arguments
/// * `label_p` - flattened label map (p,)
/// * `h_lk` - per-label rows (l x k), row `i` for label `i`, background included
///
/// # Returns
/// `p x k` matrix
pub fn broadcast_by_label(label_p: &Tensor, h_lk: &Tensor) -> Result<Tensor> {
    let (nl, _) = h_lk.dims2()?;
    let label_p = label_p.flatten_all()?.to_dtype(DType::U32)?;
    check_label_range(&label_p, nl)?;
    h_lk.contiguous()?.index_select(&label_p, 0)
}

/// Nearest-neighbour resize of a label map (h x w) to a new grid,
/// keeping integer labels intact
pub fn resize_labels_nearest(label_hw: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let (h, w) = label_hw.dims2()?;
    let device = label_hw.device();
    let rows = nearest_index(h, target_h, device)?;
    let cols = nearest_index(w, target_w, device)?;
    label_hw
        .contiguous()?
        .index_select(&rows, 0)?
        .index_select(&cols, 1)
}

/// `1 + max label`, i.e., the number of label rows including background
pub fn num_labels(label: &Tensor) -> Result<usize> {
    let max_label = label
        .flatten_all()?
        .to_dtype(DType::U32)?
        .max(0)?
        .to_scalar::<u32>()?;
    Ok(max_label as usize + 1)
}

fn nearest_index(src: usize, dst: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = (0..dst)
        .map(|i| ((i * src) / dst.max(1)).min(src.saturating_sub(1)) as u32)
        .collect();
    Tensor::from_vec(idx, dst, device)
}

fn check_label_range(label_p: &Tensor, num_labels: usize) -> Result<()> {
    if label_p.dim(0)? == 0 {
        return Ok(());
    }
    let max_label = label_p.max(0)?.to_scalar::<u32>()? as usize;
    if max_label >= num_labels {
        bail!(
            "label {} out of range for {} label rows",
            max_label,
            num_labels
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_by_label_excludes_background() -> Result<()> {
        let dev = Device::Cpu;
        let label = Tensor::new(&[[0u32, 1, 1], [2, 1, 0]], &dev)?;
        let x_pk = Tensor::new(
            &[
                [1f32, 10.],
                [2., 20.],
                [3., 30.],
                [4., 40.],
                [5., 50.],
                [6., 60.],
            ],
            &dev,
        )?;
        let pooled: Vec<Vec<f32>> = pool_by_label(&label, &x_pk, 3)?.to_vec2()?;
        assert_eq!(pooled, vec![vec![10., 100.], vec![4., 40.]]);
        Ok(())
    }

    #[test]
    fn test_broadcast_and_resize() -> Result<()> {
        let dev = Device::Cpu;
        let label = Tensor::new(&[[0u32, 0, 1, 1], [0, 0, 1, 1], [2, 2, 1, 1], [2, 2, 1, 1]], &dev)?;
        let small = resize_labels_nearest(&label, 2, 2)?;
        let small_vec: Vec<Vec<u32>> = small.to_vec2()?;
        assert_eq!(small_vec, vec![vec![0, 1], vec![2, 1]]);

        let h_lk = Tensor::new(&[[0f32], [1.], [2.]], &dev)?;
        let px: Vec<Vec<f32>> = broadcast_by_label(&small, &h_lk)?.to_vec2()?;
        assert_eq!(px, vec![vec![0.], vec![1.], vec![2.], vec![1.]]);

        assert_eq!(num_labels(&label)?, 3);
        assert!(pool_by_label(&label, &Tensor::zeros((16, 1), DType::F32, &dev)?, 2).is_err());
        Ok(())
    }
}
