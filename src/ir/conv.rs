//! Channels-last (NHWC) convolution, transposed convolution and pooling kernels.
//!
//! Kernels are laid out `[kernel_h, kernel_w, in_channels, out_channels]` for
//! convolution. A transposed convolution reuses the same geometry read in the
//! opposite direction, so its kernel is `[kernel_h, kernel_w, out_channels,
//! in_channels]` and its forward pass is the input-gradient of a convolution.

use crate::ir::tensor::{Tensor, TensorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    Valid,
    Same,
    Explicit {
        top: usize,
        left: usize,
        bottom: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2DSpec {
    pub strides: [usize; 2],
    pub padding: Padding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSpec {
    pub window: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
}

/// Fully resolved sliding-window geometry for one spatial configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub in_hw: [usize; 2],
    pub kernel_hw: [usize; 2],
    pub strides: [usize; 2],
    pub pad_top: usize,
    pub pad_left: usize,
    pub out_hw: [usize; 2],
}

impl Conv2DSpec {
    #[must_use]
    pub fn same(stride: usize) -> Self {
        Self {
            strides: [stride, stride],
            padding: Padding::Same,
        }
    }

    pub fn geometry(
        &self,
        in_hw: [usize; 2],
        kernel_hw: [usize; 2],
    ) -> Result<WindowGeometry, TensorError> {
        resolve_window(in_hw, kernel_hw, self.strides, self.padding)
    }

    /// Spatial size produced by a transposed convolution over `in_hw`.
    pub fn transpose_output_hw(
        &self,
        in_hw: [usize; 2],
        kernel_hw: [usize; 2],
    ) -> Result<[usize; 2], TensorError> {
        check_strides(self.strides)?;
        let mut out = [0usize; 2];
        for axis in 0..2 {
            let (stride, k, input) = (self.strides[axis], kernel_hw[axis], in_hw[axis]);
            out[axis] = match self.padding {
                Padding::Same => input * stride,
                Padding::Valid => input.saturating_sub(1) * stride + k,
                Padding::Explicit {
                    top,
                    left,
                    bottom,
                    right,
                } => {
                    let pads = if axis == 0 { top + bottom } else { left + right };
                    (input.saturating_sub(1) * stride + k)
                        .checked_sub(pads)
                        .ok_or_else(|| TensorError {
                            message: format!(
                                "transposed conv padding {pads} exceeds output extent on axis {axis}"
                            ),
                        })?
                }
            };
        }
        Ok(out)
    }

    /// Geometry of the forward convolution a transposed convolution inverts:
    /// reading from `out_hw` (large) down to `in_hw` (small).
    pub fn transpose_geometry(
        &self,
        in_hw: [usize; 2],
        kernel_hw: [usize; 2],
    ) -> Result<WindowGeometry, TensorError> {
        let out_hw = self.transpose_output_hw(in_hw, kernel_hw)?;
        let geometry = self.geometry(out_hw, kernel_hw)?;
        if geometry.out_hw != in_hw {
            return Err(TensorError {
                message: format!(
                    "transposed conv geometry mismatch: {in_hw:?} upsampled to {out_hw:?} does not invert"
                ),
            });
        }
        Ok(geometry)
    }
}

impl PoolSpec {
    pub fn geometry(&self, in_hw: [usize; 2]) -> Result<WindowGeometry, TensorError> {
        resolve_window(in_hw, self.window, self.strides, self.padding)
    }
}

fn check_strides(strides: [usize; 2]) -> Result<(), TensorError> {
    if strides.contains(&0) {
        return Err(TensorError {
            message: format!("strides must be positive, got {strides:?}"),
        });
    }
    Ok(())
}

fn resolve_window(
    in_hw: [usize; 2],
    kernel_hw: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
) -> Result<WindowGeometry, TensorError> {
    check_strides(strides)?;
    if kernel_hw.contains(&0) {
        return Err(TensorError {
            message: format!("kernel extent must be positive, got {kernel_hw:?}"),
        });
    }

    let mut out_hw = [0usize; 2];
    let mut pad_before = [0usize; 2];
    for axis in 0..2 {
        let (input, k, stride) = (in_hw[axis], kernel_hw[axis], strides[axis]);
        let (padded, before) = match padding {
            Padding::Valid => (input, 0),
            Padding::Same => {
                let out = input.div_ceil(stride);
                let needed = (out.saturating_sub(1) * stride + k).saturating_sub(input);
                (input + needed, needed / 2)
            }
            Padding::Explicit {
                top,
                left,
                bottom,
                right,
            } => {
                if axis == 0 {
                    (input + top + bottom, top)
                } else {
                    (input + left + right, left)
                }
            }
        };
        if padded < k {
            return Err(TensorError {
                message: format!(
                    "window {kernel_hw:?} does not fit input {in_hw:?} with padding {padding:?}"
                ),
            });
        }
        out_hw[axis] = (padded - k) / stride + 1;
        pad_before[axis] = before;
    }

    Ok(WindowGeometry {
        in_hw,
        kernel_hw,
        strides,
        pad_top: pad_before[0],
        pad_left: pad_before[1],
        out_hw,
    })
}

impl WindowGeometry {
    /// Maps an output position and kernel tap to an input position, if in bounds.
    #[inline]
    fn source(&self, out_pos: [usize; 2], tap: [usize; 2]) -> Option<[usize; 2]> {
        let y = (out_pos[0] * self.strides[0] + tap[0]).checked_sub(self.pad_top)?;
        let x = (out_pos[1] * self.strides[1] + tap[1]).checked_sub(self.pad_left)?;
        (y < self.in_hw[0] && x < self.in_hw[1]).then_some([y, x])
    }
}

fn nhwc_dims(tensor: &Tensor, label: &str) -> Result<[usize; 4], TensorError> {
    match tensor.shape.as_slice() {
        [n, h, w, c] => Ok([*n, *h, *w, *c]),
        other => Err(TensorError {
            message: format!("{label} expects an NHWC tensor, got shape {other:?}"),
        }),
    }
}

/// Forward convolution. `kernel` is `[kh, kw, in_c, out_c]`.
pub fn conv2d(input: &Tensor, kernel: &Tensor, spec: &Conv2DSpec) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, in_c] = nhwc_dims(input, "conv2d input")?;
    let [kh, kw, k_in, out_c] = nhwc_dims(kernel, "conv2d kernel")?;
    if k_in != in_c {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in conv2d: input channels {in_c}, kernel expects {k_in}"
            ),
        });
    }
    let g = spec.geometry([in_h, in_w], [kh, kw])?;
    Ok(convolve(input, kernel, &g, batch, in_c, out_c))
}

fn convolve(
    input: &Tensor,
    kernel: &Tensor,
    g: &WindowGeometry,
    batch: usize,
    in_c: usize,
    out_c: usize,
) -> Tensor {
    let [in_h, in_w] = g.in_hw;
    let [out_h, out_w] = g.out_hw;
    let [kh, kw] = g.kernel_hw;
    let mut out = vec![0.0_f32; batch * out_h * out_w * out_c];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let out_base = ((b * out_h + oy) * out_w + ox) * out_c;
                for ky in 0..kh {
                    for kx in 0..kw {
                        let Some([iy, ix]) = g.source([oy, ox], [ky, kx]) else {
                            continue;
                        };
                        let in_base = ((b * in_h + iy) * in_w + ix) * in_c;
                        let k_base = (ky * kw + kx) * in_c * out_c;
                        for ci in 0..in_c {
                            let x = input.data[in_base + ci];
                            if x == 0.0 {
                                continue;
                            }
                            let row = &kernel.data[k_base + ci * out_c..k_base + (ci + 1) * out_c];
                            let acc = &mut out[out_base..out_base + out_c];
                            for (o, w) in acc.iter_mut().zip(row) {
                                *o += x * *w;
                            }
                        }
                    }
                }
            }
        }
    }

    Tensor {
        shape: vec![batch, out_h, out_w, out_c],
        data: out,
    }
}

/// Gradient of [`conv2d`] with respect to its input; also the forward pass of
/// a transposed convolution.
fn scatter_input(
    grad: &Tensor,
    kernel: &Tensor,
    g: &WindowGeometry,
    batch: usize,
    in_c: usize,
    out_c: usize,
) -> Tensor {
    let [in_h, in_w] = g.in_hw;
    let [out_h, out_w] = g.out_hw;
    let [kh, kw] = g.kernel_hw;
    let mut dx = vec![0.0_f32; batch * in_h * in_w * in_c];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let g_base = ((b * out_h + oy) * out_w + ox) * out_c;
                let upstream = &grad.data[g_base..g_base + out_c];
                if upstream.iter().all(|v| *v == 0.0) {
                    continue;
                }
                for ky in 0..kh {
                    for kx in 0..kw {
                        let Some([iy, ix]) = g.source([oy, ox], [ky, kx]) else {
                            continue;
                        };
                        let in_base = ((b * in_h + iy) * in_w + ix) * in_c;
                        let k_base = (ky * kw + kx) * in_c * out_c;
                        for ci in 0..in_c {
                            let row = &kernel.data[k_base + ci * out_c..k_base + (ci + 1) * out_c];
                            let acc = row
                                .iter()
                                .zip(upstream)
                                .map(|(w, u)| *w * *u)
                                .sum::<f32>();
                            dx[in_base + ci] += acc;
                        }
                    }
                }
            }
        }
    }

    Tensor {
        shape: vec![batch, in_h, in_w, in_c],
        data: dx,
    }
}

fn accumulate_filter(
    input: &Tensor,
    grad: &Tensor,
    g: &WindowGeometry,
    batch: usize,
    in_c: usize,
    out_c: usize,
) -> Tensor {
    let [in_h, in_w] = g.in_hw;
    let [out_h, out_w] = g.out_hw;
    let [kh, kw] = g.kernel_hw;
    let mut dw = vec![0.0_f32; kh * kw * in_c * out_c];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let g_base = ((b * out_h + oy) * out_w + ox) * out_c;
                let upstream = &grad.data[g_base..g_base + out_c];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let Some([iy, ix]) = g.source([oy, ox], [ky, kx]) else {
                            continue;
                        };
                        let in_base = ((b * in_h + iy) * in_w + ix) * in_c;
                        let k_base = (ky * kw + kx) * in_c * out_c;
                        for ci in 0..in_c {
                            let x = input.data[in_base + ci];
                            if x == 0.0 {
                                continue;
                            }
                            let row = &mut dw[k_base + ci * out_c..k_base + (ci + 1) * out_c];
                            for (d, u) in row.iter_mut().zip(upstream) {
                                *d += x * *u;
                            }
                        }
                    }
                }
            }
        }
    }

    Tensor {
        shape: vec![kh, kw, in_c, out_c],
        data: dw,
    }
}

/// Input gradient of [`conv2d`]; `input_hw` is the spatial size of the original input.
pub fn conv2d_backprop_input(
    grad: &Tensor,
    kernel: &Tensor,
    spec: &Conv2DSpec,
    input_hw: [usize; 2],
) -> Result<Tensor, TensorError> {
    let [batch, g_h, g_w, g_c] = nhwc_dims(grad, "conv2d_backprop_input grad")?;
    let [kh, kw, in_c, out_c] = nhwc_dims(kernel, "conv2d_backprop_input kernel")?;
    let g = spec.geometry(input_hw, [kh, kw])?;
    if g.out_hw != [g_h, g_w] || g_c != out_c {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in conv2d_backprop_input: grad {:?}, expected spatial {:?} with {out_c} channels",
                grad.shape, g.out_hw
            ),
        });
    }
    Ok(scatter_input(grad, kernel, &g, batch, in_c, out_c))
}

/// Kernel gradient of [`conv2d`] with a `[kh, kw]` window.
pub fn conv2d_backprop_filter(
    input: &Tensor,
    grad: &Tensor,
    spec: &Conv2DSpec,
    kernel_hw: [usize; 2],
) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, in_c] = nhwc_dims(input, "conv2d_backprop_filter input")?;
    let [g_batch, g_h, g_w, out_c] = nhwc_dims(grad, "conv2d_backprop_filter grad")?;
    let g = spec.geometry([in_h, in_w], kernel_hw)?;
    if g_batch != batch || g.out_hw != [g_h, g_w] {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in conv2d_backprop_filter: input {:?}, grad {:?}",
                input.shape, grad.shape
            ),
        });
    }
    Ok(accumulate_filter(input, grad, &g, batch, in_c, out_c))
}

/// Transposed convolution. `kernel` is `[kh, kw, out_c, in_c]`.
pub fn conv2d_transpose(
    input: &Tensor,
    kernel: &Tensor,
    spec: &Conv2DSpec,
) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, in_c] = nhwc_dims(input, "conv2d_transpose input")?;
    let [kh, kw, out_c, k_in] = nhwc_dims(kernel, "conv2d_transpose kernel")?;
    if k_in != in_c {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in conv2d_transpose: input channels {in_c}, kernel expects {k_in}"
            ),
        });
    }
    let g = spec.transpose_geometry([in_h, in_w], [kh, kw])?;
    Ok(scatter_input(input, kernel, &g, batch, out_c, in_c))
}

/// Input gradient of [`conv2d_transpose`]: a plain convolution of the upstream gradient.
pub fn conv2d_transpose_backprop_input(
    grad: &Tensor,
    kernel: &Tensor,
    spec: &Conv2DSpec,
) -> Result<Tensor, TensorError> {
    conv2d(grad, kernel, spec)
}

/// Kernel gradient of [`conv2d_transpose`] for the original `input`.
pub fn conv2d_transpose_backprop_filter(
    input: &Tensor,
    grad: &Tensor,
    spec: &Conv2DSpec,
    kernel_hw: [usize; 2],
) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, in_c] = nhwc_dims(input, "conv2d_transpose_backprop_filter input")?;
    let [g_batch, g_h, g_w, out_c] = nhwc_dims(grad, "conv2d_transpose_backprop_filter grad")?;
    let g = spec.transpose_geometry([in_h, in_w], kernel_hw)?;
    if g_batch != batch || g.in_hw != [g_h, g_w] {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in conv2d_transpose_backprop_filter: input {:?}, grad {:?}",
                input.shape, grad.shape
            ),
        });
    }
    Ok(accumulate_filter(grad, input, &g, batch, out_c, in_c))
}

pub fn max_pool(input: &Tensor, spec: &PoolSpec) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, c] = nhwc_dims(input, "max_pool input")?;
    let g = spec.geometry([in_h, in_w])?;
    let [out_h, out_w] = g.out_hw;
    let mut out = vec![f32::NEG_INFINITY; batch * out_h * out_w * c];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let out_base = ((b * out_h + oy) * out_w + ox) * c;
                for ky in 0..g.kernel_hw[0] {
                    for kx in 0..g.kernel_hw[1] {
                        let Some([iy, ix]) = g.source([oy, ox], [ky, kx]) else {
                            continue;
                        };
                        let in_base = ((b * in_h + iy) * in_w + ix) * c;
                        for ch in 0..c {
                            let slot = &mut out[out_base + ch];
                            *slot = slot.max(input.data[in_base + ch]);
                        }
                    }
                }
            }
        }
    }

    Tensor::new(vec![batch, out_h, out_w, c], out)
}

/// Routes each upstream gradient to the first maximal element of its window.
pub fn max_pool_backward(
    input: &Tensor,
    grad: &Tensor,
    spec: &PoolSpec,
) -> Result<Tensor, TensorError> {
    let [batch, in_h, in_w, c] = nhwc_dims(input, "max_pool_backward input")?;
    let g = spec.geometry([in_h, in_w])?;
    let [out_h, out_w] = g.out_hw;
    if grad.shape != [batch, out_h, out_w, c] {
        return Err(TensorError {
            message: format!(
                "Shape mismatch in max_pool_backward: grad {:?}, expected {:?}",
                grad.shape,
                [batch, out_h, out_w, c]
            ),
        });
    }
    let mut dx = vec![0.0_f32; input.data.len()];

    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let out_base = ((b * out_h + oy) * out_w + ox) * c;
                for ch in 0..c {
                    let mut best: Option<(usize, f32)> = None;
                    for ky in 0..g.kernel_hw[0] {
                        for kx in 0..g.kernel_hw[1] {
                            let Some([iy, ix]) = g.source([oy, ox], [ky, kx]) else {
                                continue;
                            };
                            let index = ((b * in_h + iy) * in_w + ix) * c + ch;
                            let value = input.data[index];
                            if best.is_none_or(|(_, current)| value > current) {
                                best = Some((index, value));
                            }
                        }
                    }
                    if let Some((index, _)) = best {
                        dx[index] += grad.data[out_base + ch];
                    }
                }
            }
        }
    }

    Tensor::new(input.shape.clone(), dx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Vec<usize>) -> Tensor {
        let count = shape.iter().product::<usize>();
        let data = (0..count).map(|i| (i % 7) as f32 - 3.0).collect();
        Tensor::new(shape, data).expect("valid tensor")
    }

    fn dot(a: &Tensor, b: &Tensor) -> f32 {
        a.data.iter().zip(b.data.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn same_padding_matches_reference_arithmetic() {
        let spec = Conv2DSpec::same(2);
        let g = spec.geometry([10, 36], [4, 4]).expect("geometry");
        assert_eq!(g.out_hw, [5, 18]);
        assert_eq!((g.pad_top, g.pad_left), (1, 1));

        let up = Conv2DSpec::same(8);
        assert_eq!(
            up.transpose_output_hw([20, 72], [16, 16]).expect("extent"),
            [160, 576]
        );
        let g = up.transpose_geometry([20, 72], [16, 16]).expect("geometry");
        assert_eq!((g.pad_top, g.pad_left), (4, 4));
    }

    #[test]
    fn one_by_one_conv_is_per_pixel_matmul() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("input");
        let kernel = Tensor::new(vec![1, 1, 2, 1], vec![10.0, 1.0]).expect("kernel");
        let out = conv2d(&input, &kernel, &Conv2DSpec::same(1)).expect("conv");
        assert_eq!(out.shape, vec![1, 1, 2, 1]);
        assert_eq!(out.data, vec![12.0, 34.0]);
    }

    #[test]
    fn transpose_conv_upsamples_by_stride() {
        let input = ramp(vec![2, 3, 5, 4]);
        let kernel = ramp(vec![4, 4, 6, 4]);
        let out = conv2d_transpose(&input, &kernel, &Conv2DSpec::same(2)).expect("transpose");
        assert_eq!(out.shape, vec![2, 6, 10, 6]);
    }

    #[test]
    fn conv_backprop_input_is_adjoint_of_forward() {
        // <conv(x, w), y> == <x, conv_backprop_input(y, w)>
        let spec = Conv2DSpec::same(2);
        let x = ramp(vec![1, 6, 7, 3]);
        let w = ramp(vec![3, 3, 3, 2]);
        let y_fwd = conv2d(&x, &w, &spec).expect("conv");
        let y = ramp(y_fwd.shape.clone());
        let dx = conv2d_backprop_input(&y, &w, &spec, [6, 7]).expect("backprop");
        assert!((dot(&y_fwd, &y) - dot(&x, &dx)).abs() < 1e-3);
    }

    #[test]
    fn conv_backprop_filter_is_adjoint_of_forward() {
        // <conv(x, w), y> == <w, conv_backprop_filter(x, y)>
        let spec = Conv2DSpec {
            strides: [1, 2],
            padding: Padding::Valid,
        };
        let x = ramp(vec![2, 5, 6, 2]);
        let w = ramp(vec![2, 3, 2, 3]);
        let y_fwd = conv2d(&x, &w, &spec).expect("conv");
        let y = ramp(y_fwd.shape.clone());
        let dw = conv2d_backprop_filter(&x, &y, &spec, [2, 3]).expect("backprop");
        assert_eq!(dw.shape, w.shape);
        assert!((dot(&y_fwd, &y) - dot(&w, &dw)).abs() < 1e-3);
    }

    #[test]
    fn transpose_filter_gradient_is_adjoint() {
        let spec = Conv2DSpec::same(2);
        let x = ramp(vec![1, 3, 4, 2]);
        let w = ramp(vec![4, 4, 3, 2]);
        let y_fwd = conv2d_transpose(&x, &w, &spec).expect("transpose");
        let y = ramp(y_fwd.shape.clone());
        let dw = conv2d_transpose_backprop_filter(&x, &y, &spec, [4, 4]).expect("dw");
        let dx = conv2d_transpose_backprop_input(&y, &w, &spec).expect("dx");
        assert_eq!(dw.shape, w.shape);
        assert_eq!(dx.shape, x.shape);
        assert!((dot(&y_fwd, &y) - dot(&w, &dw)).abs() < 1e-3);
        assert!((dot(&y_fwd, &y) - dot(&x, &dx)).abs() < 1e-3);
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let input = Tensor::new(vec![1, 2, 2, 1], vec![1.0, 5.0, 3.0, 2.0]).expect("input");
        let spec = PoolSpec {
            window: [2, 2],
            strides: [2, 2],
            padding: Padding::Valid,
        };
        let out = max_pool(&input, &spec).expect("pool");
        assert_eq!(out.data, vec![5.0]);
        let grad = Tensor::new(vec![1, 1, 1, 1], vec![2.0]).expect("g");
        let dx = max_pool_backward(&input, &grad, &spec).expect("backward");
        assert_eq!(dx.data, vec![0.0, 2.0, 0.0, 0.0]);
    }
}
