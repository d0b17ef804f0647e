//! An adaptive No-U-Turn sampler for unnormalized log-densities.
//!
//! The sampler consumes a user supplied gradient oracle (see [`LogpFunc`])
//! and draws from the corresponding distribution with Hamiltonian Monte
//! Carlo: multinomial NUTS trajectories, dual averaging step size
//! adaptation and windowed diagonal or dense mass matrix adaptation.
//! Constrained parameters can be handled through the
//! [`transforms`](crate::transforms) layer, and the
//! [`diagnostics`](crate::diagnostics) module provides effective sample
//! size and split-R̂ estimates over the finished chains.
//!
//! ```
//! use nutmeg::test_models::NormalLogp;
//! use nutmeg::{sample, NutsSettings};
//!
//! let logp = NormalLogp::new(3, 0.5);
//! let settings = NutsSettings {
//!     num_tune: 200,
//!     num_draws: 200,
//!     num_chains: 2,
//!     ..NutsSettings::default()
//! };
//!
//! let results = sample(&logp, &[0.0; 3], &settings).unwrap();
//! assert_eq!(results.len(), 2);
//! assert_eq!(results[0].draws.len(), 200);
//! ```

pub(crate) mod adapt;
pub(crate) mod chain;
pub mod diagnostics;
pub(crate) mod hamiltonian;
pub(crate) mod logp;
pub(crate) mod math;
pub(crate) mod metric;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod state;
pub(crate) mod stepsize;
pub mod transforms;

pub use adapt::{AdaptOptions, MetricKind};
pub use chain::{DrawStats, NutsChain};
pub use hamiltonian::{DivergenceInfo, Hamiltonian};
pub use logp::{LogpError, LogpFunc, TransformedLogp, TransformedLogpError};
pub use metric::{DenseMetric, DiagMetric, Metric};
pub use nuts::{NutsError, NutsOptions};
pub use sampler::{
    sample, sample_with_abort, test_models, ChainResult, NutsSettings, SamplerError,
};
pub use stepsize::{DualAverageOptions, DualAverageSettings};
