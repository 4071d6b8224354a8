//! CPU kernels for convolutional image classifiers
//!
//! This module provides the operations a ResNet forward pass needs:
//! - 2D convolution (im2col + matmul)
//! - Batch normalization (running statistics or batch statistics)
//! - ReLU and residual addition
//! - Max pooling and global average pooling
//! - Fully connected projection
//!
//! All image tensors are NCHW; convolution weights are OIHW.

use crate::errors::{ParityError, Result};
use crate::tensor::Tensor;

// ============== Convolution ==============

/// 2D convolution: input[N, C, H, W] * weight[O, C, KH, KW] -> [N, O, OH, OW]
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&[f32]>,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (o, wc, kh, kw) = weight.dims4()?;

    if wc != c {
        return Err(ParityError::Shape(format!(
            "Conv2d channel mismatch: input has {} channels, weight expects {}",
            c, wc
        )));
    }
    if stride == 0 {
        return Err(ParityError::Shape("Conv2d stride must be positive".into()));
    }
    if h + 2 * padding < kh || w + 2 * padding < kw {
        return Err(ParityError::Shape(format!(
            "Conv2d kernel {}x{} larger than padded input {}x{}",
            kh,
            kw,
            h + 2 * padding,
            w + 2 * padding
        )));
    }
    if let Some(b) = bias {
        if b.len() != o {
            return Err(ParityError::Shape(format!(
                "Conv2d bias has {} entries for {} output channels",
                b.len(),
                o
            )));
        }
    }

    let oh = (h + 2 * padding - kh) / stride + 1;
    let ow = (w + 2 * padding - kw) / stride + 1;
    let k = c * kh * kw;
    let p = oh * ow;

    let pointwise = kh == 1 && kw == 1 && stride == 1 && padding == 0;
    let mut cols = if pointwise { Vec::new() } else { vec![0.0; k * p] };
    let mut out = vec![0.0; n * o * p];

    for b in 0..n {
        let image = &input.data[b * c * h * w..(b + 1) * c * h * w];
        let cols: &[f32] = if pointwise {
            image
        } else {
            im2col(image, (c, h, w), (kh, kw), stride, padding, (oh, ow), &mut cols);
            &cols
        };

        let out_b = &mut out[b * o * p..(b + 1) * o * p];
        for oc in 0..o {
            let row = &mut out_b[oc * p..(oc + 1) * p];
            if let Some(bias) = bias {
                row.fill(bias[oc]);
            }
            let w_row = &weight.data[oc * k..(oc + 1) * k];
            for (q, &wv) in w_row.iter().enumerate() {
                let col = &cols[q * p..(q + 1) * p];
                for (r, &cv) in row.iter_mut().zip(col) {
                    *r += wv * cv;
                }
            }
        }
    }

    Tensor::new(vec![n, o, oh, ow], out)
}

/// Unfold one CHW image into a [C*KH*KW, OH*OW] patch matrix
fn im2col(
    image: &[f32],
    (c, h, w): (usize, usize, usize),
    (kh, kw): (usize, usize),
    stride: usize,
    padding: usize,
    (oh, ow): (usize, usize),
    cols: &mut [f32],
) {
    let p = oh * ow;
    for ch in 0..c {
        let plane = &image[ch * h * w..(ch + 1) * h * w];
        for ki in 0..kh {
            for kj in 0..kw {
                let q = (ch * kh + ki) * kw + kj;
                let dst = &mut cols[q * p..(q + 1) * p];
                for y in 0..oh {
                    let iy = (y * stride + ki) as isize - padding as isize;
                    let dst_row = &mut dst[y * ow..(y + 1) * ow];
                    if iy < 0 || iy >= h as isize {
                        dst_row.fill(0.0);
                        continue;
                    }
                    let src_row = &plane[iy as usize * w..(iy as usize + 1) * w];
                    for (x, d) in dst_row.iter_mut().enumerate() {
                        let ix = (x * stride + kj) as isize - padding as isize;
                        *d = if ix < 0 || ix >= w as isize {
                            0.0
                        } else {
                            src_row[ix as usize]
                        };
                    }
                }
            }
        }
    }
}

// ============== Normalization ==============

/// Batch normalization with fixed statistics (inference mode)
pub fn batch_norm(
    input: &Tensor,
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    eps: f32,
) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    check_channel_params(c, &[gamma, beta, mean, var])?;

    let plane = h * w;
    let mut out = input.clone();
    for b in 0..n {
        for ch in 0..c {
            let scale = gamma[ch] / (var[ch] + eps).sqrt();
            let shift = beta[ch] - mean[ch] * scale;
            let start = (b * c + ch) * plane;
            for v in &mut out.data[start..start + plane] {
                *v = *v * scale + shift;
            }
        }
    }
    Ok(out)
}

/// Batch normalization using the statistics of `input` itself (training mode)
///
/// Mean and biased variance are taken per channel over N, H and W.
pub fn batch_norm_batch_stats(
    input: &Tensor,
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    check_channel_params(c, &[gamma, beta])?;

    let plane = h * w;
    let count = (n * plane) as f64;
    let mut mean = vec![0.0f32; c];
    let mut var = vec![0.0f32; c];

    for ch in 0..c {
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for b in 0..n {
            let start = (b * c + ch) * plane;
            for &v in &input.data[start..start + plane] {
                sum += v as f64;
                sum_sq += (v as f64) * (v as f64);
            }
        }
        let m = sum / count;
        mean[ch] = m as f32;
        var[ch] = (sum_sq / count - m * m).max(0.0) as f32;
    }

    batch_norm(input, gamma, beta, &mean, &var, eps)
}

fn check_channel_params(channels: usize, params: &[&[f32]]) -> Result<()> {
    if let Some(bad) = params.iter().find(|p| p.len() != channels) {
        return Err(ParityError::Shape(format!(
            "BatchNorm parameter has {} entries for {} channels",
            bad.len(),
            channels
        )));
    }
    Ok(())
}

// ============== Activations ==============

/// ReLU activation, in place
pub fn relu_inplace(tensor: &mut Tensor) {
    for v in &mut tensor.data {
        *v = v.max(0.0);
    }
}

/// Element-wise `acc += other`
pub fn add_inplace(acc: &mut Tensor, other: &Tensor) -> Result<()> {
    if acc.shape != other.shape {
        return Err(ParityError::Shape(format!(
            "Shape mismatch for add: {:?} vs {:?}",
            acc.shape, other.shape
        )));
    }
    for (a, b) in acc.data.iter_mut().zip(&other.data) {
        *a += b;
    }
    Ok(())
}

// ============== Pooling ==============

/// 2D max pooling; padded positions never win
pub fn max_pool2d(input: &Tensor, kernel: usize, stride: usize, padding: usize) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    if kernel == 0 || stride == 0 {
        return Err(ParityError::Shape(
            "MaxPool kernel and stride must be positive".into(),
        ));
    }
    if h + 2 * padding < kernel || w + 2 * padding < kernel {
        return Err(ParityError::Shape(format!(
            "MaxPool kernel {} larger than padded input {}x{}",
            kernel,
            h + 2 * padding,
            w + 2 * padding
        )));
    }

    let oh = (h + 2 * padding - kernel) / stride + 1;
    let ow = (w + 2 * padding - kernel) / stride + 1;
    let mut out = Vec::with_capacity(n * c * oh * ow);

    for plane in input.data.chunks_exact(h * w) {
        for y in 0..oh {
            for x in 0..ow {
                let mut best = f32::NEG_INFINITY;
                for ki in 0..kernel {
                    let iy = (y * stride + ki) as isize - padding as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kj in 0..kernel {
                        let ix = (x * stride + kj) as isize - padding as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        best = best.max(plane[iy as usize * w + ix as usize]);
                    }
                }
                out.push(best);
            }
        }
    }

    Tensor::new(vec![n, c, oh, ow], out)
}

/// Average over H and W: [N, C, H, W] -> [N, C]
pub fn global_avg_pool(input: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let plane = h * w;
    if plane == 0 {
        return Err(ParityError::Shape("Cannot pool an empty spatial plane".into()));
    }
    let data = input
        .data
        .chunks_exact(plane)
        .map(|p| (p.iter().map(|&v| v as f64).sum::<f64>() / plane as f64) as f32)
        .collect();
    Tensor::new(vec![n, c], data)
}

// ============== Fully connected ==============

/// input[N, IN] @ weight[OUT, IN]^T + bias -> [N, OUT]
pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&[f32]>) -> Result<Tensor> {
    let (n, in_features) = match input.shape.as_slice() {
        &[n, f] => (n, f),
        other => {
            return Err(ParityError::Shape(format!(
                "Linear expects a [batch, features] input, got {:?}",
                other
            )))
        }
    };
    let (out_features, w_in) = match weight.shape.as_slice() {
        &[o, i] => (o, i),
        other => {
            return Err(ParityError::Shape(format!(
                "Linear weight must be [out, in], got {:?}",
                other
            )))
        }
    };
    if w_in != in_features {
        return Err(ParityError::Shape(format!(
            "Linear shape mismatch: {}x{} @ ({}x{})^T",
            n, in_features, out_features, w_in
        )));
    }
    if let Some(b) = bias {
        if b.len() != out_features {
            return Err(ParityError::Shape(format!(
                "Linear bias has {} entries for {} outputs",
                b.len(),
                out_features
            )));
        }
    }

    let mut out = Vec::with_capacity(n * out_features);
    for x in input.data.chunks_exact(in_features) {
        for (o, w_row) in weight.data.chunks_exact(in_features).enumerate() {
            let dot: f32 = x.iter().zip(w_row).map(|(a, b)| a * b).sum();
            out.push(dot + bias.map_or(0.0, |b| b[o]));
        }
    }

    Tensor::new(vec![n, out_features], out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    fn seq(shape: Vec<usize>) -> Tensor {
        let len = shape.iter().product();
        Tensor::new(shape, (0..len).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        let input = seq(vec![1, 1, 3, 3]);
        let weight = Tensor::new(vec![1, 1, 1, 1], vec![1.0]).unwrap();
        let out = conv2d(&input, &weight, None, 1, 0).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_conv2d_3x3_padded_sum() {
        // All-ones 3x3 kernel with padding 1 sums each neighbourhood
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let weight = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]).unwrap();
        let out = conv2d(&input, &weight, Some(&[0.5]), 1, 1).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        for v in out.data() {
            assert!(approx_eq(*v, 10.5, 1e-6));
        }
    }

    #[test]
    fn test_conv2d_stride_and_channels() {
        let input = seq(vec![1, 2, 4, 4]);
        // Output channel 0 reads channel 0, output channel 1 reads channel 1
        let weight = Tensor::new(vec![2, 2, 1, 1], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let out = conv2d(&input, &weight, None, 2, 0).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        assert_eq!(&out.data()[0..4], &[0.0, 2.0, 8.0, 10.0]);
        assert_eq!(&out.data()[4..8], &[16.0, 18.0, 24.0, 26.0]);
    }

    #[test]
    fn test_conv2d_channel_mismatch() {
        let input = Tensor::zeros(vec![1, 3, 4, 4]);
        let weight = Tensor::zeros(vec![1, 2, 1, 1]);
        assert!(conv2d(&input, &weight, None, 1, 0).is_err());
    }

    #[test]
    fn test_batch_norm_running_stats() {
        let input = Tensor::new(vec![1, 1, 1, 2], vec![1.0, 3.0]).unwrap();
        let out = batch_norm(&input, &[2.0], &[1.0], &[1.0], &[4.0], 0.0).unwrap();
        // (x - 1) / 2 * 2 + 1
        assert_eq!(out.data(), &[1.0, 3.0]);
    }

    #[test]
    fn test_batch_norm_batch_stats_normalizes() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = batch_norm_batch_stats(&input, &[1.0], &[0.0], 0.0).unwrap();
        let mean: f32 = out.data().iter().sum::<f32>() / 4.0;
        let var: f32 = out.data().iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(approx_eq(mean, 0.0, 1e-6));
        assert!(approx_eq(var, 1.0, 1e-5));
    }

    #[test]
    fn test_batch_norm_param_length() {
        let input = Tensor::zeros(vec![1, 2, 1, 1]);
        assert!(batch_norm(&input, &[1.0], &[0.0, 0.0], &[0.0, 0.0], &[1.0, 1.0], 1e-5).is_err());
    }

    #[test]
    fn test_relu_and_add() {
        let mut a = Tensor::new(vec![3], vec![-1.0, 0.5, 2.0]).unwrap();
        relu_inplace(&mut a);
        assert_eq!(a.data(), &[0.0, 0.5, 2.0]);

        let b = Tensor::new(vec![3], vec![1.0, 1.0, 1.0]).unwrap();
        add_inplace(&mut a, &b).unwrap();
        assert_eq!(a.data(), &[1.0, 1.5, 3.0]);

        assert!(add_inplace(&mut a, &Tensor::zeros(vec![2])).is_err());
    }

    #[test]
    fn test_max_pool_ignores_padding() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![-4.0, -3.0, -2.0, -1.0]).unwrap();
        let out = max_pool2d(&input, 3, 2, 1).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out.data(), &[-1.0]);
    }

    #[test]
    fn test_max_pool_resnet_stem_shape() {
        let input = Tensor::zeros(vec![1, 4, 112, 112]);
        let out = max_pool2d(&input, 3, 2, 1).unwrap();
        assert_eq!(out.shape(), &[1, 4, 56, 56]);
    }

    #[test]
    fn test_global_avg_pool() {
        let input = seq(vec![1, 2, 2, 2]);
        let out = global_avg_pool(&input).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(out.data(), &[1.5, 5.5]);
    }

    #[test]
    fn test_linear() {
        let x = Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let w = Tensor::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let out = linear(&x, &w, Some(&[0.0, 0.0, -3.0])).unwrap();
        assert_eq!(out.shape(), &[1, 3]);
        assert_eq!(out.data(), &[1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let x = Tensor::zeros(vec![1, 3]);
        let w = Tensor::zeros(vec![2, 2]);
        assert!(linear(&x, &w, None).is_err());
    }
}
