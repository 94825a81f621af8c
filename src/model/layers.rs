use crate::ir::{Conv2DSpec, Op, ValueId};
use crate::model::{DecoderError, RegularizationLosses, l2_regularizer};
use crate::session::{Initializer, Session, VariableOrigin};

/// A trainable layer that adds its own variables to the session.
pub trait Layer {
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, DecoderError>;

    fn build(
        &self,
        session: &mut Session,
        input: ValueId,
        regularizers: &mut RegularizationLosses,
    ) -> Result<ValueId, DecoderError>;
}

/// Same-padded convolution with bias. Kernel `[k, k, in, filters]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2DLayer {
    pub name: String,
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub l2_scale: Option<f32>,
}

/// Same-padded transposed convolution with bias; upsamples by `stride`.
/// Kernel `[k, k, filters, in]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2DTransposeLayer {
    pub name: String,
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub l2_scale: Option<f32>,
}

impl Layer for Conv2DLayer {
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, DecoderError> {
        let [n, h, w, _] = nhwc(input, &self.name)?;
        let spec = Conv2DSpec::same(self.stride);
        let geometry = spec
            .geometry([h, w], [self.kernel_size, self.kernel_size])
            .map_err(|err| DecoderError::Shape(format!("{}: {}", self.name, err.message)))?;
        Ok(vec![n, geometry.out_hw[0], geometry.out_hw[1], self.filters])
    }

    fn build(
        &self,
        session: &mut Session,
        input: ValueId,
        regularizers: &mut RegularizationLosses,
    ) -> Result<ValueId, DecoderError> {
        let in_shape = session.static_shape(input)?;
        let expected = self.output_shape(&in_shape)?;
        let [_, _, _, in_c] = nhwc(&in_shape, &self.name)?;
        let k = self.kernel_size;
        let (kernel, bias) = weights(
            session,
            &self.name,
            vec![k, k, in_c, self.filters],
            self.filters,
            self.l2_scale,
            regularizers,
        )?;
        let y = session.add(Op::Conv2D {
            input,
            kernel,
            spec: Conv2DSpec::same(self.stride),
        })?;
        let out = session.add(Op::BiasAdd { input: y, bias })?;
        check_output(session, out, &expected, &self.name)?;
        Ok(out)
    }
}

impl Layer for Conv2DTransposeLayer {
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, DecoderError> {
        let [n, h, w, _] = nhwc(input, &self.name)?;
        let spec = Conv2DSpec::same(self.stride);
        let out_hw = spec
            .transpose_output_hw([h, w], [self.kernel_size, self.kernel_size])
            .map_err(|err| DecoderError::Shape(format!("{}: {}", self.name, err.message)))?;
        Ok(vec![n, out_hw[0], out_hw[1], self.filters])
    }

    fn build(
        &self,
        session: &mut Session,
        input: ValueId,
        regularizers: &mut RegularizationLosses,
    ) -> Result<ValueId, DecoderError> {
        let in_shape = session.static_shape(input)?;
        let expected = self.output_shape(&in_shape)?;
        let [_, _, _, in_c] = nhwc(&in_shape, &self.name)?;
        let k = self.kernel_size;
        let (kernel, bias) = weights(
            session,
            &self.name,
            vec![k, k, self.filters, in_c],
            self.filters,
            self.l2_scale,
            regularizers,
        )?;
        let y = session.add(Op::Conv2DTranspose {
            input,
            kernel,
            spec: Conv2DSpec::same(self.stride),
        })?;
        let out = session.add(Op::BiasAdd { input: y, bias })?;
        check_output(session, out, &expected, &self.name)?;
        Ok(out)
    }
}

fn weights(
    session: &mut Session,
    name: &str,
    kernel_shape: Vec<usize>,
    filters: usize,
    l2_scale: Option<f32>,
    regularizers: &mut RegularizationLosses,
) -> Result<(ValueId, ValueId), DecoderError> {
    let kernel_name = format!("{name}/kernel");
    let kernel = session.variable(
        &kernel_name,
        kernel_shape,
        Initializer::GlorotUniform,
        VariableOrigin::Decoder,
    )?;
    let bias = session.variable(
        &format!("{name}/bias"),
        vec![filters],
        Initializer::Zeros,
        VariableOrigin::Decoder,
    )?;
    if let Some(scale) = l2_scale {
        let penalty = l2_regularizer(session, kernel, scale)?;
        regularizers.push(kernel_name, penalty);
    }
    Ok((kernel, bias))
}

fn nhwc(shape: &[usize], layer: &str) -> Result<[usize; 4], DecoderError> {
    match shape {
        [n, h, w, c] => Ok([*n, *h, *w, *c]),
        other => Err(DecoderError::Shape(format!(
            "{layer}: expected an NHWC input, got {other:?}"
        ))),
    }
}

fn check_output(
    session: &Session,
    value: ValueId,
    expected: &[usize],
    layer: &str,
) -> Result<(), DecoderError> {
    let actual = session.static_shape(value)?;
    if actual != expected {
        return Err(DecoderError::Shape(format!(
            "{layer}: built {actual:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_layer_predicts_upsampled_shape() {
        let layer = Conv2DTransposeLayer {
            name: "up".to_string(),
            filters: 6,
            kernel_size: 16,
            stride: 8,
            l2_scale: None,
        };
        assert_eq!(
            layer.output_shape(&[1, 20, 72, 4]).expect("shape"),
            vec![1, 160, 576, 6]
        );
    }

    #[test]
    fn conv_layer_registers_one_penalty_per_kernel() {
        let mut session = Session::new(0);
        let x = session.placeholder("x", vec![1, 5, 18, 8]).expect("placeholder");
        let mut regs = RegularizationLosses::new();
        let layer = Conv2DLayer {
            name: "score".to_string(),
            filters: 2,
            kernel_size: 1,
            stride: 1,
            l2_scale: Some(1e-4),
        };
        let y = layer.build(&mut session, x, &mut regs).expect("build");
        assert_eq!(session.shape(y), Some(&[1, 5, 18, 2][..]));
        assert_eq!(regs.len(), 1);
        assert_eq!(
            regs.iter().next().map(|term| term.variable.as_str()),
            Some("score/kernel")
        );
        assert_eq!(session.variables().count(), 2);
    }
}
