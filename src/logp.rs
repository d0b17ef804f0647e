use thiserror::Error;

use crate::transforms::TransformSpec;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for std::convert::Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// The log-density gradient oracle.
///
/// Implementations evaluate an unnormalized log-density and its gradient in
/// the unconstrained space the sampler works in. Evaluations at the same
/// position must return the same value; any data buffers the oracle needs
/// can live in `&mut self`.
pub trait LogpFunc {
    type Err: LogpError + 'static;

    fn dim(&self) -> usize;

    /// Evaluate the log-density at `position` and store the gradient
    /// in `grad`.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err>;
}

#[derive(Error, Debug)]
pub enum TransformedLogpError<E: LogpError> {
    #[error("Model density evaluation failed")]
    Model(#[source] E),
    #[error("Density or gradient was not finite")]
    NonFinite,
}

impl<E: LogpError + 'static> LogpError for TransformedLogpError<E> {
    fn is_recoverable(&self) -> bool {
        match self {
            TransformedLogpError::Model(err) => err.is_recoverable(),
            TransformedLogpError::NonFinite => true,
        }
    }
}

/// An oracle on constrained space, pushed to unconstrained space.
///
/// Wraps a model density whose gradient is taken with respect to the
/// constrained parameters and composes it with a [`TransformSpec`]: the
/// wrapped density is evaluated at the constrained image of the position,
/// the transform's log-Jacobian is added, and the gradient is pulled back
/// analytically.
///
/// Non-finite densities or gradients surface as a recoverable error, so
/// trajectory building treats them as divergences.
#[derive(Clone)]
pub struct TransformedLogp<F> {
    model: F,
    transforms: TransformSpec,
    constrained: Vec<f64>,
    constrained_grad: Vec<f64>,
}

impl<F: LogpFunc> TransformedLogp<F> {
    /// The model's dimension must match the transform's constrained side.
    pub fn new(model: F, transforms: TransformSpec) -> Option<Self> {
        if model.dim() != transforms.constrained_dim() {
            return None;
        }
        let n_cons = transforms.constrained_dim();
        Some(TransformedLogp {
            model,
            transforms,
            constrained: vec![0f64; n_cons],
            constrained_grad: vec![0f64; n_cons],
        })
    }

    pub fn transforms(&self) -> &TransformSpec {
        &self.transforms
    }

    /// Map an unconstrained draw to constrained space.
    pub fn constrain(&self, unconstrained: &[f64], out: &mut [f64]) {
        self.transforms.constrain(unconstrained, out);
    }
}

impl<F: LogpFunc> LogpFunc for TransformedLogp<F> {
    type Err = TransformedLogpError<F::Err>;

    fn dim(&self) -> usize {
        self.transforms.dim()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::Err> {
        let logj = self.transforms.constrain(position, &mut self.constrained);
        let model_logp = self
            .model
            .logp(&self.constrained, &mut self.constrained_grad)
            .map_err(TransformedLogpError::Model)?;
        let logp = model_logp + logj;
        self.transforms
            .pullback(position, &self.constrained, &self.constrained_grad, grad);
        if !logp.is_finite() || grad.iter().any(|x| !x.is_finite()) {
            return Err(TransformedLogpError::NonFinite);
        }
        Ok(logp)
    }
}
