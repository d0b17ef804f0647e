use nutmeg::test_models::BernoulliProblem;
use nutmeg::transforms::{Transform, TransformSpec};
use nutmeg::{sample, NutsSettings, TransformedLogp};

#[test]
fn bernoulli_posterior_mean_is_plausible() {
    let spec =
        TransformSpec::new(vec![("alpha".into(), Transform::UnitInterval { len: 1 })]).unwrap();
    let model = BernoulliProblem {
        trials: 20,
        successes: 10,
    };
    let logp = TransformedLogp::new(model, spec.clone()).unwrap();

    let settings = NutsSettings {
        num_tune: 400,
        num_draws: 1000,
        num_chains: 5,
        seed: 17,
        ..NutsSettings::default()
    };
    let results = sample(&logp, &[0.0], &settings).unwrap();

    let mut sum = 0f64;
    let mut count = 0usize;
    let mut alpha = [0f64];
    for result in &results {
        assert_eq!(result.draws.len(), 1000);
        for draw in &result.draws {
            spec.constrain(draw, &mut alpha);
            assert!(alpha[0] > 0. && alpha[0] < 1.);
            sum += alpha[0];
            count += 1;
        }
    }
    let mean = sum / count as f64;

    // The posterior is Beta(11, 11) with mean one half.
    assert!(
        mean > 0.3 && mean < 0.7,
        "posterior mean of alpha was {mean}"
    );
}
