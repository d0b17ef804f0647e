use nutmeg::diagnostics::{parameter_chains, split_rhat};
use nutmeg::test_models::{LinearRegression, LogisticRegression};
use nutmeg::transforms::{Transform, TransformSpec};
use nutmeg::{sample, NutsSettings, TransformedLogp};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

#[test]
fn linear_regression_recovers_coefficients() {
    let mut rng = SmallRng::seed_from_u64(42);
    let (b0, b1, sigma) = (1.5, -2.0, 0.5);
    let predictors: Vec<[f64; 2]> = (0..50).map(|i| [1., i as f64 / 10. - 2.5]).collect();
    let responses: Vec<f64> = predictors
        .iter()
        .map(|x| {
            let noise: f64 = rng.sample(StandardNormal);
            b0 * x[0] + b1 * x[1] + sigma * noise
        })
        .collect();

    let spec = TransformSpec::new(vec![
        ("beta".into(), Transform::Identity { len: 2 }),
        ("sigma".into(), Transform::Positive { len: 1 }),
    ])
    .unwrap();
    let model = LinearRegression {
        predictors,
        responses,
    };
    let logp = TransformedLogp::new(model, spec.clone()).unwrap();

    let settings = NutsSettings {
        num_tune: 500,
        num_draws: 1000,
        num_chains: 2,
        seed: 5,
        ..NutsSettings::default()
    };
    // The unconstrained start maps to beta = 0, sigma = 1.
    let results = sample(&logp, &[0., 0., 0.], &settings).unwrap();

    let mut sums = [0f64; 3];
    let mut count = 0usize;
    let mut cons = [0f64; 3];
    for result in &results {
        for draw in &result.draws {
            spec.constrain(draw, &mut cons);
            for (sum, &c) in sums.iter_mut().zip(&cons) {
                *sum += c;
            }
            count += 1;
        }
    }
    let means: Vec<f64> = sums.iter().map(|sum| sum / count as f64).collect();

    assert!((means[0] - b0).abs() < 0.3, "intercept mean {}", means[0]);
    assert!((means[1] - b1).abs() < 0.3, "slope mean {}", means[1]);
    assert!(
        means[2] > 0.3 && means[2] < 0.8,
        "noise scale mean {}",
        means[2]
    );
}

#[test]
fn logistic_regression_recovers_coefficients() {
    let mut rng = SmallRng::seed_from_u64(7);
    let (b0, b1) = (0.8, -1.2);
    let predictors: Vec<[f64; 2]> = (0..300)
        .map(|i| [1., (i % 60) as f64 / 10. - 3.])
        .collect();
    let outcomes: Vec<f64> = predictors
        .iter()
        .map(|x| {
            let eta = b0 * x[0] + b1 * x[1];
            let prob = 1. / (1. + (-eta).exp());
            if rng.random::<f64>() < prob {
                1.
            } else {
                0.
            }
        })
        .collect();

    let logp = LogisticRegression {
        predictors,
        outcomes,
    };
    let settings = NutsSettings {
        num_tune: 400,
        num_draws: 1000,
        num_chains: 2,
        seed: 19,
        ..NutsSettings::default()
    };
    let results = sample(&logp, &[0., 0.], &settings).unwrap();

    for (index, true_val) in [b0, b1].into_iter().enumerate() {
        let chains = parameter_chains(&results, index);
        let views: Vec<&[f64]> = chains.iter().map(|chain| chain.as_slice()).collect();
        let rhat = split_rhat(&views);
        assert!((rhat - 1.).abs() < 0.05, "parameter {index}: rhat {rhat}");

        let flat: Vec<f64> = chains.iter().flatten().copied().collect();
        let mean = flat.iter().sum::<f64>() / flat.len() as f64;
        assert!(
            (mean - true_val).abs() < 0.6,
            "parameter {index}: mean {mean} vs {true_val}"
        );
    }
}
